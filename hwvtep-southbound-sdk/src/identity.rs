use hwvtep_southbound_error::ParseError;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    net::IpAddr,
    sync::Arc,
};

/// URI scheme used for node ids derived from a device endpoint.
pub const HWVTEP_URI_PREFIX: &str = "hwvtep";

/// Stable key identifying a device endpoint.
///
/// Either `hwvtep://<ip>:<port>` when derived from the remote endpoint, or a
/// logical node id assigned by the operator. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(Arc<str>);

impl DeviceIdentity {
    #[inline]
    pub fn from_node_id(node_id: impl AsRef<str>) -> Self {
        Self(Arc::from(node_id.as_ref()))
    }

    pub fn from_endpoint(ip: IpAddr, port: u16) -> Self {
        Self(Arc::from(format!("{HWVTEP_URI_PREFIX}://{ip}:{port}")))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the endpoint for ids built by [`DeviceIdentity::from_endpoint`].
    pub fn endpoint(&self) -> Option<(IpAddr, u16)> {
        let rest = self
            .0
            .strip_prefix(HWVTEP_URI_PREFIX)
            .and_then(|s| s.strip_prefix("://"))?;
        let (ip, port) = rest.rsplit_once(':')?;
        Some((ip.parse().ok()?, port.parse().ok()?))
    }
}

impl Display for DeviceIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&ConnectionInfo> for DeviceIdentity {
    fn from(info: &ConnectionInfo) -> Self {
        DeviceIdentity::from_endpoint(info.remote_ip, info.remote_port)
    }
}

/// Addressing of one transport connection to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    #[serde(default)]
    pub local_ip: Option<IpAddr>,
    #[serde(default)]
    pub local_port: Option<u16>,
}

impl ConnectionInfo {
    #[inline]
    pub fn new(remote_ip: IpAddr, remote_port: u16) -> Self {
        Self {
            remote_ip,
            remote_port,
            local_ip: None,
            local_port: None,
        }
    }

    /// Build from textual address and port as found in operator config.
    pub fn parse(address: &str, port: &str) -> Result<Self, ParseError> {
        let remote_ip = address
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| ParseError::new(address, "ip address"))?;
        let remote_port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| ParseError::new(port, "port number"))?;
        Ok(Self::new(remote_ip, remote_port))
    }

    #[inline]
    pub fn with_local(mut self, local_ip: IpAddr, local_port: u16) -> Self {
        self.local_ip = Some(local_ip);
        self.local_port = Some(local_port);
        self
    }

    #[inline]
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::from(self)
    }
}

impl Display for ConnectionInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.remote_ip, self.remote_port)
    }
}
