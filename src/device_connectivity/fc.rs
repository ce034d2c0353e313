//! Fibre Channel connectivity: online-port discovery and LIP rescans.
//!
//! FC fabric login is managed by the kernel, so there is no login step; the
//! interesting work is finding which FC hosts are online and driving their
//! LIP + bus rescan control files.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::errors::{DeviceConnectivityError, Result};
use super::executor::Executor;
use super::iscsi::SCSI_HOST_SYSFS_PATH;
use super::scsi_generic::{DEV_BY_PATH, ScsiGenericHelper};
use super::OsDeviceConnectivity;

pub const FC_HOST_SYSFS_PATH: &str = "/sys/class/fc_host";

const PORT_STATE_ONLINE: &str = "online";

pub struct FcConnectivity {
    executor: Arc<dyn Executor>,
    helper: Arc<ScsiGenericHelper>,
}

impl FcConnectivity {
    pub fn new(executor: Arc<dyn Executor>, helper: Arc<ScsiGenericHelper>) -> Self {
        Self { executor, helper }
    }

    /// Return the host numbers of every FC host whose `port_state` reads
    /// `online` (the kernel varies the capitalization). Unreadable hosts are
    /// treated as offline and skipped.
    pub fn get_fc_host_ids(&self) -> Result<Vec<u32>> {
        let pattern = format!("{FC_HOST_SYSFS_PATH}/host*/port_state");
        let port_state_paths = self.executor.filepath_glob(&pattern)?;
        if port_state_paths.is_empty() {
            return Err(DeviceConnectivityError::FcHostTargetNotFound {
                directory: FC_HOST_SYSFS_PATH.to_string(),
            });
        }

        let mut host_ids = Vec::new();
        for port_state_path in &port_state_paths {
            let path_str = port_state_path.to_string_lossy();
            let Some(host_number) = host_number_of(&path_str) else {
                continue;
            };
            match self.executor.read_file(&path_str) {
                Ok(state) if state.trim().eq_ignore_ascii_case(PORT_STATE_ONLINE) => {
                    host_ids.push(host_number);
                }
                Ok(state) => {
                    debug!(host = host_number, state = %state.trim(), "fc host is not online");
                }
                Err(e) => {
                    warn!(path = %path_str, error = %e, "could not read fc port state, treating host as offline");
                }
            }
        }

        if host_ids.is_empty() {
            return Err(DeviceConnectivityError::FcHostTargetNotFound {
                directory: FC_HOST_SYSFS_PATH.to_string(),
            });
        }
        Ok(host_ids)
    }
}

/// Parse the `<N>` out of `.../host<N>/port_state`.
fn host_number_of(port_state_path: &str) -> Option<u32> {
    port_state_path
        .split('/')
        .rev()
        .nth(1)
        .and_then(|component| component.strip_prefix("host"))
        .and_then(|suffix| suffix.parse::<u32>().ok())
}

impl OsDeviceConnectivity for FcConnectivity {
    /// FC fabric login is kernel-managed; nothing to do.
    fn ensure_login(&self, _ips_by_array_initiator: &HashMap<String, Vec<String>>) -> Result<()> {
        debug!("fc fabric login is managed by the kernel, skipping");
        Ok(())
    }

    /// Issue a LIP on every online FC host, then rescan its bus with the
    /// wildcard `- - -` scan command.
    fn rescan_devices(&self, lun_id: i32, array_initiators: &[String]) -> Result<()> {
        debug!(lun = lun_id, initiators = ?array_initiators, "rescanning fc devices");
        let host_ids = self.get_fc_host_ids()?;
        for host_number in host_ids {
            let lip_filename = format!("{SCSI_HOST_SYSFS_PATH}/host{host_number}/issue_lip");
            self.executor.write_file(&lip_filename, "1")?;

            let scan_filename = format!("{SCSI_HOST_SYSFS_PATH}/host{host_number}/scan");
            debug!(file = %scan_filename, "rescanning fc scsi host");
            let written = self.executor.write_file(&scan_filename, "- - -")?;
            if written == 0 {
                return Err(DeviceConnectivityError::NothingWasWrittenToScanFile(
                    scan_filename,
                ));
            }
        }
        Ok(())
    }

    fn get_mpath_device(
        &self,
        volume_id: &str,
        lun_id: i32,
        array_initiators: &[String],
    ) -> Result<String> {
        let patterns: Vec<String> = array_initiators
            .iter()
            .map(|wwn| format!("{DEV_BY_PATH}/pci-fc-{wwn}-lun-{lun_id}"))
            .collect();
        self.helper.get_mpath_device_for_patterns(volume_id, &patterns)
    }

    fn flush_multipath_device(&self, dm_name: &str) -> Result<()> {
        self.helper.flush_multipath_device(dm_name)
    }

    fn remove_physical_device(&self, sys_devices: &[String]) -> Result<()> {
        self.helper.remove_physical_device(sys_devices)
    }
}
