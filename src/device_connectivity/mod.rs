//! OS device connectivity: discovering, rescanning, flushing and removing
//! SCSI/multipath devices for volumes reachable over iSCSI or Fibre Channel.
//!
//! The two connectivity types share one public operation set
//! ([`OsDeviceConnectivity`]) and one sysfs-walking core
//! ([`ScsiGenericHelper`]). RPCs that carry no publish context resolve
//! devices through the narrower [`OsDeviceConnectivityHelper`].

mod errors;
mod executor;
mod fc;
mod iscsi;
mod scsi_generic;

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

pub use errors::DeviceConnectivityError;
pub use executor::{Executor, SystemExecutor};
pub use fc::{FC_HOST_SYSFS_PATH, FcConnectivity};
pub use iscsi::{ISCSI_HOST_SYSFS_PATH, IscsiConnectivity, SCSI_HOST_SYSFS_PATH};
pub use scsi_generic::{DEV_BY_PATH, DEV_PATH, SYS_BLOCK_PATH, ScsiGenericHelper, volume_uuid};

#[cfg(test)]
pub use executor::MockExecutor;

use errors::Result;

/// Transport over which a volume's LUN reaches this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    Iscsi,
    Fc,
}

impl Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::Iscsi => write!(f, "iscsi"),
            ConnectionType::Fc => write!(f, "fc"),
        }
    }
}

impl FromStr for ConnectionType {
    type Err = DeviceConnectivityError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "iscsi" => Ok(ConnectionType::Iscsi),
            "fc" => Ok(ConnectionType::Fc),
            other => Err(DeviceConnectivityError::UnsupportedConnectivityType(
                other.to_string(),
            )),
        }
    }
}

/// Full per-protocol connectivity surface used by NodeStageVolume.
#[cfg_attr(test, automock)]
pub trait OsDeviceConnectivity: Send + Sync {
    /// Make sure the node has a session/fabric path to every array
    /// initiator before rescanning for the LUN.
    fn ensure_login(&self, ips_by_array_initiator: &HashMap<String, Vec<String>>) -> Result<()>;

    /// Ask the kernel to discover the LUN on every relevant SCSI host.
    fn rescan_devices(&self, lun_id: i32, array_initiators: &[String]) -> Result<()>;

    /// Resolve the volume to its single multipath device via the
    /// protocol-specific `/dev/disk/by-path` names.
    fn get_mpath_device(
        &self,
        volume_id: &str,
        lun_id: i32,
        array_initiators: &[String],
    ) -> Result<String>;

    fn flush_multipath_device(&self, dm_name: &str) -> Result<()>;

    fn remove_physical_device(&self, sys_devices: &[String]) -> Result<()>;
}

/// Connectivity-agnostic subset used by Unstage/Publish/Expand, which only
/// know the volume id.
#[cfg_attr(test, automock)]
pub trait OsDeviceConnectivityHelper: Send + Sync {
    fn get_mpath_device(&self, volume_id: &str) -> Result<String>;

    fn flush_multipath_device(&self, dm_name: &str) -> Result<()>;

    fn remove_physical_device(&self, sys_devices: &[String]) -> Result<()>;
}

/// Build the connectivity dispatch table plus the shared SCSI-generic helper,
/// all backed by the same executor.
pub fn build_connectivity_map(
    executor: Arc<dyn Executor>,
) -> (
    HashMap<ConnectionType, Arc<dyn OsDeviceConnectivity>>,
    Arc<ScsiGenericHelper>,
) {
    let helper = Arc::new(ScsiGenericHelper::new(executor.clone()));

    let mut mapping: HashMap<ConnectionType, Arc<dyn OsDeviceConnectivity>> = HashMap::new();
    mapping.insert(
        ConnectionType::Iscsi,
        Arc::new(IscsiConnectivity::new(executor.clone(), helper.clone())),
    );
    mapping.insert(
        ConnectionType::Fc,
        Arc::new(FcConnectivity::new(executor, helper.clone())),
    );

    (mapping, helper)
}
