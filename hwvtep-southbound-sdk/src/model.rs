use crate::version::Version;
use hwvtep_southbound_error::{SouthboundError, SouthboundResult};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    net::IpAddr,
    sync::Arc,
};

/// Database name of the hardware VTEP schema.
pub const HARDWARE_VTEP: &str = "hardware_vtep";

/// Encapsulation used for VXLAN tunnel locators.
pub const VXLAN_OVER_IPV4: &str = "vxlan_over_ipv4";

/// Who produced a write. Carried on every store write and change so the
/// reconciler can drop changes it must not send back to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Origin {
    Controller,
    Device,
}

/// Which side is authoritative for an entity kind during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Authority {
    /// Operator intent held in the store.
    Controller,
    /// Runtime state only the device produces.
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    LogicalSwitch,
    TerminationPoint,
    RemoteUcastMac,
    RemoteMcastMac,
    LocalUcastMac,
}

impl EntityKind {
    /// Device table backing this kind.
    #[inline]
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::LogicalSwitch => "Logical_Switch",
            EntityKind::TerminationPoint => "Physical_Locator",
            EntityKind::RemoteUcastMac => "Ucast_Macs_Remote",
            EntityKind::RemoteMcastMac => "Mcast_Macs_Remote",
            EntityKind::LocalUcastMac => "Ucast_Macs_Local",
        }
    }

    /// Referenced kinds have a lower rank than the kinds referencing them.
    #[inline]
    pub fn dependency_rank(&self) -> u8 {
        match self {
            EntityKind::LogicalSwitch | EntityKind::TerminationPoint => 0,
            EntityKind::RemoteUcastMac | EntityKind::RemoteMcastMac | EntityKind::LocalUcastMac => {
                1
            }
        }
    }

    #[inline]
    pub fn authority(&self) -> Authority {
        match self {
            EntityKind::LocalUcastMac => Authority::Device,
            _ => Authority::Controller,
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Key of one entity inside a device subtree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub name: Arc<str>,
}

impl EntityKey {
    #[inline]
    pub fn new(kind: EntityKind, name: impl AsRef<str>) -> Self {
        Self {
            kind,
            name: Arc::from(name.as_ref()),
        }
    }

    pub fn logical_switch(name: impl AsRef<str>) -> Self {
        Self::new(EntityKind::LogicalSwitch, name)
    }

    pub fn locator(encapsulation: &str, dst_ip: IpAddr) -> Self {
        Self::new(
            EntityKind::TerminationPoint,
            format!("{encapsulation}:{dst_ip}"),
        )
    }

    pub fn mac(kind: EntityKind, logical_switch: &str, mac: &str) -> Self {
        Self::new(kind, format!("{logical_switch}/{}", mac.to_ascii_lowercase()))
    }
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.table(), self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalSwitch {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_key: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_mode: Option<String>,
}

/// Physical locator: the tunnel endpoint MACs point at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationPoint {
    pub dst_ip: IpAddr,
    #[serde(default = "TerminationPoint::default_encapsulation")]
    pub encapsulation: String,
}

impl TerminationPoint {
    fn default_encapsulation() -> String {
        VXLAN_OVER_IPV4.to_string()
    }

    pub fn vxlan(dst_ip: IpAddr) -> Self {
        Self {
            dst_ip,
            encapsulation: Self::default_encapsulation(),
        }
    }

    #[inline]
    pub fn key(&self) -> EntityKey {
        EntityKey::locator(&self.encapsulation, self.dst_ip)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUcastMac {
    pub mac: String,
    pub logical_switch: String,
    /// Name of the referenced termination point key.
    pub locator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMcastMac {
    pub mac: String,
    pub logical_switch: String,
    pub locators: Vec<String>,
}

/// MAC learned by the device on one of its own ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalUcastMac {
    pub mac: String,
    pub logical_switch: String,
    pub locator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
}

/// Typed row of one hardware_vtep entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "row", rename_all = "camelCase")]
pub enum EntityData {
    LogicalSwitch(LogicalSwitch),
    TerminationPoint(TerminationPoint),
    RemoteUcastMac(RemoteUcastMac),
    RemoteMcastMac(RemoteMcastMac),
    LocalUcastMac(LocalUcastMac),
}

impl EntityData {
    #[inline]
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityData::LogicalSwitch(_) => EntityKind::LogicalSwitch,
            EntityData::TerminationPoint(_) => EntityKind::TerminationPoint,
            EntityData::RemoteUcastMac(_) => EntityKind::RemoteUcastMac,
            EntityData::RemoteMcastMac(_) => EntityKind::RemoteMcastMac,
            EntityData::LocalUcastMac(_) => EntityKind::LocalUcastMac,
        }
    }

    /// Key derived from the identifying columns of the row.
    pub fn key(&self) -> EntityKey {
        match self {
            EntityData::LogicalSwitch(ls) => EntityKey::logical_switch(&ls.name),
            EntityData::TerminationPoint(tp) => tp.key(),
            EntityData::RemoteUcastMac(m) => {
                EntityKey::mac(EntityKind::RemoteUcastMac, &m.logical_switch, &m.mac)
            }
            EntityData::RemoteMcastMac(m) => {
                EntityKey::mac(EntityKind::RemoteMcastMac, &m.logical_switch, &m.mac)
            }
            EntityData::LocalUcastMac(m) => {
                EntityKey::mac(EntityKind::LocalUcastMac, &m.logical_switch, &m.mac)
            }
        }
    }

    /// Entities this row points at; they must exist on the device first.
    pub fn references(&self) -> Vec<EntityKey> {
        match self {
            EntityData::LogicalSwitch(_) | EntityData::TerminationPoint(_) => Vec::new(),
            EntityData::RemoteUcastMac(m) => vec![
                EntityKey::logical_switch(&m.logical_switch),
                EntityKey::new(EntityKind::TerminationPoint, &m.locator),
            ],
            EntityData::LocalUcastMac(m) => vec![
                EntityKey::logical_switch(&m.logical_switch),
                EntityKey::new(EntityKind::TerminationPoint, &m.locator),
            ],
            EntityData::RemoteMcastMac(m) => {
                let mut refs = Vec::with_capacity(m.locators.len() + 1);
                refs.push(EntityKey::logical_switch(&m.logical_switch));
                refs.extend(
                    m.locators
                        .iter()
                        .map(|l| EntityKey::new(EntityKind::TerminationPoint, l)),
                );
                refs
            }
        }
    }

    /// Device row for this entity.
    pub fn to_row(&self) -> SouthboundResult<serde_json::Value> {
        let value = match self {
            EntityData::LogicalSwitch(v) => serde_json::to_value(v)?,
            EntityData::TerminationPoint(v) => serde_json::to_value(v)?,
            EntityData::RemoteUcastMac(v) => serde_json::to_value(v)?,
            EntityData::RemoteMcastMac(v) => serde_json::to_value(v)?,
            EntityData::LocalUcastMac(v) => serde_json::to_value(v)?,
        };
        Ok(value)
    }

    /// Merge `patch` over `self`: object fields present in the patch win,
    /// absent fields are kept. Both rows must be of the same kind.
    pub fn merged_with(&self, patch: &EntityData) -> SouthboundResult<EntityData> {
        if self.kind() != patch.kind() {
            return Err(SouthboundError::Store(format!(
                "cannot merge {} into {}",
                patch.kind(),
                self.kind()
            )));
        }
        let mut base = serde_json::to_value(self)?;
        let overlay = serde_json::to_value(patch)?;
        if let (Some(base_row), Some(overlay_row)) = (
            base.get_mut("row").and_then(|r| r.as_object_mut()),
            overlay.get("row").and_then(|r| r.as_object()),
        ) {
            for (k, v) in overlay_row {
                base_row.insert(k.clone(), v.clone());
            }
        }
        Ok(serde_json::from_value(base)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Insert => f.write_str("insert"),
            OperationKind::Update => f.write_str("update"),
            OperationKind::Delete => f.write_str("delete"),
        }
    }
}

/// Row columns a device only has from some schema version on, as
/// `(table, row key, first version)`.
pub const VERSIONED_COLUMNS: &[(&str, &str, Version)] = &[
    ("Logical_Switch", "replicationMode", Version::new(1, 6, 0)),
];

/// One row-level operation of a device transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceOperation {
    pub kind: OperationKind,
    pub table: String,
    pub key: EntityKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<serde_json::Value>,
}

impl DeviceOperation {
    pub fn insert(data: &EntityData) -> SouthboundResult<Self> {
        Ok(Self {
            kind: OperationKind::Insert,
            table: data.kind().table().to_string(),
            key: data.key(),
            row: Some(data.to_row()?),
        })
    }

    pub fn update(data: &EntityData) -> SouthboundResult<Self> {
        Ok(Self {
            kind: OperationKind::Update,
            table: data.kind().table().to_string(),
            key: data.key(),
            row: Some(data.to_row()?),
        })
    }

    pub fn delete(key: EntityKey) -> Self {
        Self {
            kind: OperationKind::Delete,
            table: key.kind.table().to_string(),
            key,
            row: None,
        }
    }

    pub fn summary(&self) -> String {
        format!("{} {}", self.kind, self.key)
    }

    /// Remove the row columns a device at `version` does not know. Returns
    /// the removed columns.
    pub fn strip_unsupported(&mut self, version: &Version) -> Vec<&'static str> {
        let Some(serde_json::Value::Object(row)) = self.row.as_mut() else {
            return Vec::new();
        };
        VERSIONED_COLUMNS
            .iter()
            .filter(|(table, _, since)| *table == self.table && !version.is_at_least(since))
            .filter_map(|(_, column, _)| row.remove(*column).map(|_| *column))
            .collect()
    }
}

/// Per-operation reply from the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl OperationResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(error: impl Into<String>, details: Option<String>) -> Self {
        Self {
            error: Some(error.into()),
            details,
            ..Default::default()
        }
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Schema retrieved from a device once per activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSchema {
    pub name: String,
    /// Version text as advertised; parsed by the connection instance.
    pub version: String,
    #[serde(default)]
    pub tables: Vec<String>,
}

/// A row change reported by the device. `row == None` means deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceChange {
    pub key: EntityKey,
    pub row: Option<EntityData>,
}

/// One asynchronous update notification from the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceUpdate {
    pub changes: Vec<DeviceChange>,
}
