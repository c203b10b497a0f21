//! Identification of the compute instance this process runs on.
//!
//! The compute plane knows every server's addresses but not which one is
//! "us". Matching the node's own address against the server listing bridges
//! the two. When the node has several interfaces the address used to reach
//! the compute endpoint is the one the provider assigned, which is the
//! address [`LocalIdentity::RouteTo`] reads back from the kernel.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::{UdpSocket, lookup_host};

use crate::error::BlockDeviceError;
use crate::provider::{ComputeApi, InstanceId, ServerSummary};

/// How the local compute instance is determined.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LocalIdentity {
    /// Instance identifier supplied by the operator.
    Configured(InstanceId),
    /// Addresses owned by this node, matched against the server listing.
    Addresses(BTreeSet<IpAddr>),
    /// `host:port` of an endpoint; the source address the kernel picks to
    /// reach it is matched against the server listing.
    RouteTo(String),
}

impl Default for LocalIdentity {
    fn default() -> Self {
        Self::Addresses(BTreeSet::new())
    }
}

impl LocalIdentity {
    /// Resolves the identity to an instance identifier.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::UnknownInstance`] when no single server
    /// owns the local address, and [`BlockDeviceError::Provider`] when the
    /// server listing fails.
    pub async fn resolve<C>(&self, compute: &C) -> Result<InstanceId, BlockDeviceError>
    where
        C: ComputeApi + ?Sized,
    {
        let local = match self {
            Self::Configured(id) => return Ok(id.clone()),
            Self::Addresses(addresses) => addresses.clone(),
            Self::RouteTo(target) => BTreeSet::from([route_source_address(target).await?]),
        };
        let servers = compute.list_servers().await?;
        match_server(&servers, &local)
    }
}

/// Picks the one server owning any of `local`.
///
/// # Errors
///
/// Returns [`BlockDeviceError::UnknownInstance`] when no server or more than
/// one server matches.
pub fn match_server(
    servers: &[ServerSummary],
    local: &BTreeSet<IpAddr>,
) -> Result<InstanceId, BlockDeviceError> {
    let mut owners = servers
        .iter()
        .filter(|server| server.addresses.iter().any(|address| local.contains(address)));
    match (owners.next(), owners.next()) {
        (Some(server), None) => Ok(server.id.clone()),
        (None, _) => Err(BlockDeviceError::UnknownInstance {
            reason: format!("no server owns any of {local:?}"),
        }),
        (Some(first), Some(second)) => Err(BlockDeviceError::UnknownInstance {
            reason: format!(
                "servers {} and {} both own one of {local:?}",
                first.id, second.id
            ),
        }),
    }
}

/// Returns the source address used to reach `target`. No packet is sent.
async fn route_source_address(target: &str) -> Result<IpAddr, BlockDeviceError> {
    let failure = |detail: String| BlockDeviceError::UnknownInstance {
        reason: format!("cannot route to {target}: {detail}"),
    };
    let remote = lookup_host(target)
        .await
        .map_err(|err| failure(err.to_string()))?
        .next()
        .ok_or_else(|| failure(String::from("no addresses resolved")))?;
    let unspecified = match remote {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0))
        .await
        .map_err(|err| failure(err.to_string()))?;
    socket
        .connect(remote)
        .await
        .map_err(|err| failure(err.to_string()))?;
    socket
        .local_addr()
        .map(|address| address.ip())
        .map_err(|err| failure(err.to_string()))
}
