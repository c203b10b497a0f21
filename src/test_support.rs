//! Test support utilities shared across unit and integration tests.
//!
//! [`FakeCloud`] is an in-memory provider implementing both the block-storage
//! and compute traits. Status transitions are scripted per volume and applied
//! one step per `get`, which mirrors how a real provider is observed through
//! polling.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use uuid::Uuid;

use crate::clock::{Clock, ClockFuture};
use crate::provider::{
    BlockDeviceId, BlockStorageApi, ComputeApi, CreateVolumeRequest, InstanceId, ProviderError,
    ProviderFuture, ProviderVolume, ResourceKind, ServerAttachment, ServerSummary,
    VolumeAttachment, VolumeStatus,
};
use crate::volume::{CLUSTER_ID_LABEL, DATASET_ID_LABEL, status, volume_name};

/// Clock that only moves when slept on or advanced explicitly.
///
/// Sleeping advances the reading at once and then yields to the executor, so
/// concurrent waits on one task still take turns.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    /// Creates a clock reading zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current reading.
    #[must_use]
    pub fn now(&self) -> Duration {
        *lock(&self.now)
    }

    /// Moves the clock forward without sleeping.
    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        *now = now.saturating_add(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Self::now(self)
    }

    fn sleep(&self, duration: Duration) -> ClockFuture<'_> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One scripted provider-side change, applied on the next `get`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FakeStep {
    /// Sets the status, leaving attachments untouched.
    Status(String),
    /// Marks the volume `in-use` on the given server.
    Attached {
        /// Server receiving the volume.
        server_id: InstanceId,
        /// Device name reported by the provider.
        device: Option<String>,
    },
    /// Marks the volume `available` with no attachments.
    Detached,
    /// Removes the volume entirely.
    Gone,
}

/// Callback invoked when a scripted attachment completes.
pub type AttachHook = Arc<dyn Fn(&BlockDeviceId) + Send + Sync>;

#[derive(Default)]
struct FakeState {
    volumes: BTreeMap<BlockDeviceId, ProviderVolume>,
    servers: Vec<ServerSummary>,
    pending: BTreeMap<BlockDeviceId, VecDeque<FakeStep>>,
    occupied_servers: BTreeSet<InstanceId>,
    failures: VecDeque<ProviderError>,
    calls: Vec<String>,
    noop_delete: bool,
    attach_device: Option<String>,
    attach_hook: Option<AttachHook>,
}

/// In-memory block-storage and compute provider.
#[derive(Clone, Default)]
pub struct FakeCloud {
    state: Arc<Mutex<FakeState>>,
}

impl std::fmt::Debug for FakeCloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("FakeCloud")
            .field("volumes", &state.volumes.len())
            .field("calls", &state.calls)
            .finish_non_exhaustive()
    }
}

impl FakeCloud {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a volume as if it had been created out of band.
    pub fn insert_volume(&self, volume: ProviderVolume) {
        lock(&self.state).volumes.insert(volume.id.clone(), volume);
    }

    /// Adds a compute server to the listing.
    pub fn add_server(&self, server: ServerSummary) {
        lock(&self.state).servers.push(server);
    }

    /// Appends scripted steps for a volume.
    pub fn script(&self, id: &BlockDeviceId, steps: impl IntoIterator<Item = FakeStep>) {
        lock(&self.state)
            .pending
            .entry(id.clone())
            .or_default()
            .extend(steps);
    }

    /// Makes `delete` accept the request without ever removing the volume.
    pub fn set_noop_delete(&self, noop: bool) {
        lock(&self.state).noop_delete = noop;
    }

    /// Simulates a device slot on the server already held by a disk the
    /// provider does not manage. Attachments to it settle back to
    /// `available`.
    pub fn occupy_device_slot(&self, server_id: &InstanceId) {
        lock(&self.state).occupied_servers.insert(server_id.clone());
    }

    /// Overrides the device name reported for new attachments.
    pub fn set_attach_device(&self, device: Option<&str>) {
        lock(&self.state).attach_device = device.map(str::to_owned);
    }

    /// Registers a callback run when an attachment reaches `in-use`.
    pub fn on_attach(&self, hook: impl Fn(&BlockDeviceId) + Send + Sync + 'static) {
        lock(&self.state).attach_hook = Some(Arc::new(hook));
    }

    /// Fails the next provider call with `error`.
    pub fn fail_next(&self, error: ProviderError) {
        lock(&self.state).failures.push_back(error);
    }

    /// Returns the names of provider calls made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Returns the stored volume without applying scripted steps.
    #[must_use]
    pub fn peek(&self, id: &BlockDeviceId) -> Option<ProviderVolume> {
        lock(&self.state).volumes.get(id).cloned()
    }

    fn begin(state: &mut FakeState, call: &str) -> Result<(), ProviderError> {
        state.calls.push(call.to_owned());
        state.failures.pop_front().map_or(Ok(()), Err)
    }

    fn missing_volume(id: &BlockDeviceId) -> ProviderError {
        ProviderError::NotFound {
            resource: ResourceKind::Volume,
            id: id.to_string(),
        }
    }

    fn do_create(&self, request: &CreateVolumeRequest) -> Result<ProviderVolume, ProviderError> {
        let mut state = lock(&self.state);
        Self::begin(&mut state, "create")?;
        let id = BlockDeviceId::from(Uuid::new_v4().to_string());
        let volume = ProviderVolume {
            id: id.clone(),
            status: VolumeStatus::from(status::CREATING),
            size_gib: request.size_gib,
            name: Some(request.name.clone()),
            metadata: request.metadata.clone(),
            attachments: Vec::new(),
        };
        state.volumes.insert(id.clone(), volume.clone());
        state
            .pending
            .entry(id)
            .or_default()
            .push_back(FakeStep::Status(String::from(status::AVAILABLE)));
        Ok(volume)
    }

    fn do_get(&self, id: &BlockDeviceId) -> Result<ProviderVolume, ProviderError> {
        let (result, hook) = {
            let mut state = lock(&self.state);
            Self::begin(&mut state, "get")?;
            let step = state.pending.get_mut(id).and_then(VecDeque::pop_front);
            let hook = match &step {
                Some(FakeStep::Attached { .. }) => state.attach_hook.clone(),
                _ => None,
            };
            if let Some(step) = step {
                Self::apply(&mut state, id, step);
            }
            let result = state
                .volumes
                .get(id)
                .cloned()
                .ok_or_else(|| Self::missing_volume(id));
            (result, hook)
        };
        if let Some(hook) = hook {
            hook(id);
        }
        result
    }

    fn apply(state: &mut FakeState, id: &BlockDeviceId, step: FakeStep) {
        if matches!(step, FakeStep::Gone) {
            state.volumes.remove(id);
            state.pending.remove(id);
            return;
        }
        let Some(volume) = state.volumes.get_mut(id) else {
            return;
        };
        match step {
            FakeStep::Status(next) => volume.status = VolumeStatus::from(next),
            FakeStep::Attached { server_id, device } => {
                volume.status = VolumeStatus::from(status::IN_USE);
                volume.attachments = vec![VolumeAttachment { server_id, device }];
            }
            FakeStep::Detached => {
                volume.status = VolumeStatus::from(status::AVAILABLE);
                volume.attachments.clear();
            }
            FakeStep::Gone => {}
        }
    }

    fn do_delete(&self, id: &BlockDeviceId) -> Result<(), ProviderError> {
        let mut state = lock(&self.state);
        Self::begin(&mut state, "delete")?;
        if !state.volumes.contains_key(id) {
            return Err(Self::missing_volume(id));
        }
        if state.noop_delete {
            return Ok(());
        }
        let steps = state.pending.entry(id.clone()).or_default();
        steps.clear();
        steps.push_back(FakeStep::Status(String::from(status::DELETING)));
        steps.push_back(FakeStep::Gone);
        Ok(())
    }

    fn do_list(&self) -> Result<Vec<ProviderVolume>, ProviderError> {
        let mut state = lock(&self.state);
        Self::begin(&mut state, "list")?;
        Ok(state.volumes.values().cloned().collect())
    }

    fn do_list_servers(&self) -> Result<Vec<ServerSummary>, ProviderError> {
        let mut state = lock(&self.state);
        Self::begin(&mut state, "list_servers")?;
        Ok(state.servers.clone())
    }

    fn do_attach(
        &self,
        server_id: &InstanceId,
        volume_id: &BlockDeviceId,
        device: Option<&str>,
    ) -> Result<ServerAttachment, ProviderError> {
        let mut state = lock(&self.state);
        Self::begin(&mut state, "create_server_volume")?;
        if !state.volumes.contains_key(volume_id) {
            return Err(Self::missing_volume(volume_id));
        }
        let reported = device
            .map(str::to_owned)
            .or_else(|| state.attach_device.clone())
            .or_else(|| Some(String::from("/dev/vdb")));
        let settle = if state.occupied_servers.contains(server_id) {
            FakeStep::Status(String::from(status::AVAILABLE))
        } else {
            FakeStep::Attached {
                server_id: server_id.clone(),
                device: reported.clone(),
            }
        };
        let steps = state.pending.entry(volume_id.clone()).or_default();
        steps.push_back(FakeStep::Status(String::from(status::ATTACHING)));
        steps.push_back(settle);
        Ok(ServerAttachment {
            server_id: server_id.clone(),
            volume_id: volume_id.clone(),
            device: reported,
        })
    }

    fn do_detach(&self, server_id: &InstanceId, volume_id: &BlockDeviceId) -> Result<(), ProviderError> {
        let mut state = lock(&self.state);
        Self::begin(&mut state, "delete_server_volume")?;
        let Some(volume) = state.volumes.get(volume_id) else {
            return Err(Self::missing_volume(volume_id));
        };
        if !volume
            .attachments
            .iter()
            .any(|attachment| &attachment.server_id == server_id)
        {
            return Err(ProviderError::NotFound {
                resource: ResourceKind::Attachment,
                id: volume_id.to_string(),
            });
        }
        let steps = state.pending.entry(volume_id.clone()).or_default();
        steps.push_back(FakeStep::Status(String::from(status::DETACHING)));
        steps.push_back(FakeStep::Detached);
        Ok(())
    }
}

impl BlockStorageApi for FakeCloud {
    fn create<'a>(
        &'a self,
        request: &'a CreateVolumeRequest,
    ) -> ProviderFuture<'a, ProviderVolume> {
        Box::pin(std::future::ready(self.do_create(request)))
    }

    fn get<'a>(&'a self, id: &'a BlockDeviceId) -> ProviderFuture<'a, ProviderVolume> {
        Box::pin(std::future::ready(self.do_get(id)))
    }

    fn delete<'a>(&'a self, id: &'a BlockDeviceId) -> ProviderFuture<'a, ()> {
        Box::pin(std::future::ready(self.do_delete(id)))
    }

    fn list(&self) -> ProviderFuture<'_, Vec<ProviderVolume>> {
        Box::pin(std::future::ready(self.do_list()))
    }
}

impl ComputeApi for FakeCloud {
    fn create_server_volume<'a>(
        &'a self,
        server_id: &'a InstanceId,
        volume_id: &'a BlockDeviceId,
        device: Option<&'a str>,
    ) -> ProviderFuture<'a, ServerAttachment> {
        Box::pin(std::future::ready(self.do_attach(server_id, volume_id, device)))
    }

    fn delete_server_volume<'a>(
        &'a self,
        server_id: &'a InstanceId,
        volume_id: &'a BlockDeviceId,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(std::future::ready(self.do_detach(server_id, volume_id)))
    }

    fn list_servers(&self) -> ProviderFuture<'_, Vec<ServerSummary>> {
        Box::pin(std::future::ready(self.do_list_servers()))
    }
}

/// Builds a bare provider volume with no name or metadata.
#[must_use]
pub fn provider_volume(id: &str, volume_status: &str) -> ProviderVolume {
    ProviderVolume {
        id: BlockDeviceId::from(id),
        status: VolumeStatus::from(volume_status),
        size_gib: 1,
        name: None,
        metadata: BTreeMap::new(),
        attachments: Vec::new(),
    }
}

/// Builds a provider volume carrying the cluster tag and naming convention.
#[must_use]
pub fn cluster_volume(id: &str, cluster_id: Uuid, dataset_id: Uuid) -> ProviderVolume {
    ProviderVolume {
        name: Some(volume_name(dataset_id)),
        metadata: BTreeMap::from([
            (String::from(CLUSTER_ID_LABEL), cluster_id.to_string()),
            (String::from(DATASET_ID_LABEL), dataset_id.to_string()),
        ]),
        ..provider_volume(id, status::AVAILABLE)
    }
}

/// Builds a server summary.
///
/// # Panics
///
/// Panics when an address does not parse.
#[must_use]
pub fn server(id: &str, server_status: &str, addresses: &[&str]) -> ServerSummary {
    ServerSummary {
        id: InstanceId::from(id),
        name: format!("node-{id}"),
        status: server_status.to_owned(),
        addresses: addresses
            .iter()
            .map(|address| {
                address
                    .parse::<IpAddr>()
                    .unwrap_or_else(|err| panic!("invalid address {address}: {err}"))
            })
            .collect(),
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
