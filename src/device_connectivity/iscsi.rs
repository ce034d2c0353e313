//! iSCSI connectivity: session login, LUN rescans and multipath resolution.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::errors::{DeviceConnectivityError, Result};
use super::executor::{Executor, command_failure};
use super::scsi_generic::{DEV_BY_PATH, ScsiGenericHelper};
use super::OsDeviceConnectivity;

pub const ISCSI_HOST_SYSFS_PATH: &str = "/sys/class/iscsi_host";
pub const SCSI_HOST_SYSFS_PATH: &str = "/sys/class/scsi_host";

/// iscsiadm discovery and login are network round trips to the array.
const ISCSIADM_TIMEOUT_MS: u64 = 30_000;

pub struct IscsiConnectivity {
    executor: Arc<dyn Executor>,
    helper: Arc<ScsiGenericHelper>,
}

impl IscsiConnectivity {
    pub fn new(executor: Arc<dyn Executor>, helper: Arc<ScsiGenericHelper>) -> Self {
        Self { executor, helper }
    }

    /// Find the SCSI host numbers whose iSCSI session targets the given
    /// array IQN by reading the sessions' `targetname` attributes.
    pub fn get_iscsi_session_hosts_for_array_iqn(&self, array_iqn: &str) -> Result<Vec<u32>> {
        let host_dirs = self.executor.read_dir_names(ISCSI_HOST_SYSFS_PATH)?;
        debug!(hosts = ?host_dirs, "scanning iscsi hosts");

        let mut session_hosts = Vec::new();
        for host_name in &host_dirs {
            let Some(host_number) = host_name
                .strip_prefix("host")
                .and_then(|suffix| suffix.parse::<u32>().ok())
            else {
                continue;
            };

            let target_pattern = format!(
                "{ISCSI_HOST_SYSFS_PATH}/{host_name}/device/session*/iscsi_session/session*/targetname"
            );
            let matches = self.executor.filepath_glob(&target_pattern)?;
            if matches.is_empty() {
                debug!(host = %host_name, "no session target name under host");
                continue;
            }

            // A host may carry several sessions; any one of them naming the
            // array claims the host.
            for target_name_path in &matches {
                match self.executor.read_file(&target_name_path.to_string_lossy()) {
                    Ok(target_name) if target_name.trim() == array_iqn => {
                        debug!(host = host_number, iqn = %array_iqn, "matched iscsi session host");
                        session_hosts.push(host_number);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(path = %target_name_path.display(), error = %e, "could not read session target name");
                    }
                }
            }
        }

        if session_hosts.is_empty() {
            return Err(DeviceConnectivityError::IscsiStorageTargetNotFound {
                target_name: array_iqn.to_string(),
                directory: format!(
                    "{ISCSI_HOST_SYSFS_PATH}/host*/device/session*/iscsi_session/session*/targetname"
                ),
            });
        }
        Ok(session_hosts)
    }

    fn discover_portal(&self, portal: &str) {
        let args = vec![
            "-m".to_string(),
            "discoverydb".to_string(),
            "-t".to_string(),
            "st".to_string(),
            "-p".to_string(),
            portal.to_string(),
            "--discover".to_string(),
        ];
        match self
            .executor
            .execute_with_timeout(ISCSIADM_TIMEOUT_MS, "iscsiadm", &args)
        {
            Ok(output) if output.status.success() => {
                debug!(portal = %portal, "discovered iscsi targets on portal");
            }
            // Discovery failure is not fatal, the target may already be
            // known to the initiator database.
            Ok(output) => {
                warn!(portal = %portal, stderr = %String::from_utf8_lossy(&output.stderr).trim(), "iscsiadm discovery returned error");
            }
            Err(e) => {
                warn!(portal = %portal, error = %e, "failed to execute iscsiadm discovery");
            }
        }
    }

    fn login_portal(&self, array_iqn: &str, portal: &str) -> Result<()> {
        let args = vec![
            "-m".to_string(),
            "node".to_string(),
            "-T".to_string(),
            array_iqn.to_string(),
            "-p".to_string(),
            portal.to_string(),
            "--login".to_string(),
        ];
        let output = self
            .executor
            .execute_with_timeout(ISCSIADM_TIMEOUT_MS, "iscsiadm", &args)?;
        if output.status.success() {
            info!(iqn = %array_iqn, portal = %portal, "logged in to iscsi target");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already present") || stderr.contains("already exists") {
            debug!(iqn = %array_iqn, portal = %portal, "iscsi session already exists");
            return Ok(());
        }
        Err(command_failure("iscsiadm", &args, &output))
    }
}

impl OsDeviceConnectivity for IscsiConnectivity {
    /// Discover and log in to every portal of every array IQN. Sessions that
    /// already exist are left alone.
    fn ensure_login(&self, ips_by_array_initiator: &HashMap<String, Vec<String>>) -> Result<()> {
        for (array_iqn, portals) in ips_by_array_initiator {
            for portal in portals {
                self.discover_portal(portal);
                self.login_portal(array_iqn, portal)?;
            }
        }
        Ok(())
    }

    /// Tell every session host targeting the arrays to look for the LUN by
    /// writing `0 0 <lun>` to its scan file.
    fn rescan_devices(&self, lun_id: i32, array_initiators: &[String]) -> Result<()> {
        debug!(lun = lun_id, initiators = ?array_initiators, "rescanning iscsi devices");
        for array_iqn in array_initiators {
            let session_hosts = self.get_iscsi_session_hosts_for_array_iqn(array_iqn)?;
            for host_number in session_hosts {
                let filename = format!("{SCSI_HOST_SYSFS_PATH}/host{host_number}/scan");
                let scan_command = format!("0 0 {lun_id}");
                debug!(file = %filename, command = %scan_command, "rescanning scsi host");
                let written = self.executor.write_file(&filename, &scan_command)?;
                if written == 0 {
                    return Err(DeviceConnectivityError::NothingWasWrittenToScanFile(
                        filename,
                    ));
                }
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
            .map(|iqn| format!("{DEV_BY_PATH}/ip-*-iscsi-{iqn}-lun-{lun_id}"))
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
