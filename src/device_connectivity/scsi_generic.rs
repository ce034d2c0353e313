//! Shared SCSI/multipath helper used by both connectivity types.
//!
//! Implements the sysfs/devfs walking that turns `/dev/disk/by-path` links
//! into a single device-mapper device per volume, plus the destructive side:
//! flushing a multipath map and deleting its SCSI slaves.

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use super::errors::{DeviceConnectivityError, Result};
use super::executor::{Executor, command_failure};

pub const DEV_PATH: &str = "/dev";
pub const DEV_BY_PATH: &str = "/dev/disk/by-path";
pub const SYS_BLOCK_PATH: &str = "/sys/block";

/// How long to keep polling for by-path links after a rescan.
pub const WAIT_FOR_MPATH_RETRIES: u32 = 5;
pub const WAIT_FOR_MPATH_INTERVAL_SECONDS: u64 = 1;

/// `multipath -f` gets its own hard deadline; a wedged multipathd must not
/// hold the RPC forever.
const MULTIPATH_FLUSH_TIMEOUT_MS: u64 = 10_000;

/// By-path families scanned when only the volume id is known.
const ISCSI_BY_PATH_GLOB: &str = "ip-*-iscsi-*-lun-*";
const FC_BY_PATH_GLOB: &str = "pci-fc-*-lun-*";

/// Extract the volume WWN from a `<storage-type>:<wwn>` volume id. Ids
/// without a separator are taken verbatim.
pub fn volume_uuid(volume_id: &str) -> String {
    volume_id
        .rsplit(':')
        .next()
        .unwrap_or(volume_id)
        .to_lowercase()
}

/// Last path component of a device path ("/dev/dm-3" -> "dm-3").
fn dm_name_of(device: &str) -> &str {
    device.rsplit('/').next().unwrap_or(device)
}

/// Common multipath resolution and teardown against sysfs.
///
/// Both connectivity types delegate here; the struct also serves the RPCs
/// that carry no publish context (unstage, publish, expand) through
/// [`OsDeviceConnectivityHelper`](super::OsDeviceConnectivityHelper).
pub struct ScsiGenericHelper {
    executor: Arc<dyn Executor>,
    // Concurrent `multipath -f` invocations can race inside multipathd and
    // corrupt the map table; the critical section covers only the exec.
    mpath_flush_lock: Mutex<()>,
}

impl ScsiGenericHelper {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            mpath_flush_lock: Mutex::new(()),
        }
    }

    /// Repeatedly glob `pattern` until it yields matches, sleeping
    /// `interval_seconds` between attempts. A glob failure is returned as-is;
    /// exhausting the retries yields a `NotFound` IO error.
    pub fn wait_for_path_to_exist(
        &self,
        pattern: &str,
        max_retries: u32,
        interval_seconds: u64,
    ) -> Result<Vec<PathBuf>> {
        for _ in 0..max_retries {
            let matches = self.executor.filepath_glob(pattern)?;
            debug!(pattern = %pattern, count = matches.len(), "globbed device paths");
            if !matches.is_empty() {
                return Ok(matches);
            }
            self.executor.sleep(Duration::from_secs(interval_seconds));
        }
        Err(DeviceConnectivityError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no path matched pattern '{pattern}'"),
        )))
    }

    /// Resolve a `/dev/disk/by-path` link to its multipath device.
    ///
    /// If the link already points at a `dm-*` node its name is returned
    /// directly. Otherwise the link's `sd<X>` target is looked up under
    /// `/sys/block/dm-*/slaves/*`; the first dm device owning it wins.
    pub fn get_multipath_disk(&self, path: &str) -> Result<String> {
        let link_target = self.executor.os_read_link(path)?;
        let sdevice = link_target
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        if sdevice.starts_with("dm-") {
            debug!(device = %sdevice, "by-path link points directly at a multipath node");
            return Ok(sdevice);
        }

        let dm_paths = self
            .executor
            .filepath_glob(&format!("{SYS_BLOCK_PATH}/dm-*"))?;
        for dm_path in &dm_paths {
            let slaves_pattern = format!("{}/slaves/*", dm_path.display());
            let slaves = self.executor.filepath_glob(&slaves_pattern)?;
            for slave in &slaves {
                let slave_name = slave
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_default();
                if slave_name == sdevice {
                    let dm_name = dm_path
                        .file_name()
                        .map(|name| name.to_string_lossy().to_string())
                        .unwrap_or_default();
                    debug!(slave = %sdevice, dm = %dm_name, "matched slave under multipath device");
                    return Ok(format!("{DEV_PATH}/{dm_name}"));
                }
            }
        }

        Err(DeviceConnectivityError::MultipleDeviceNotFound {
            by_path: path.to_string(),
            link_target: link_target.to_string_lossy().to_string(),
        })
    }

    /// Resolve the by-path patterns of a volume's initiators/LUN down to the
    /// single dm device they must agree on.
    ///
    /// More than one distinct dm device is a fatal consistency error; none at
    /// all yields the recoverable not-found sentinel.
    pub fn get_mpath_device_for_patterns(
        &self,
        volume_id: &str,
        patterns: &[String],
    ) -> Result<String> {
        let mut device_paths: Vec<PathBuf> = Vec::new();
        for pattern in patterns {
            match self.wait_for_path_to_exist(
                pattern,
                WAIT_FOR_MPATH_RETRIES,
                WAIT_FOR_MPATH_INTERVAL_SECONDS,
            ) {
                Ok(mut matches) => device_paths.append(&mut matches),
                Err(DeviceConnectivityError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(pattern = %pattern, "no device path appeared for pattern");
                }
                Err(e) => return Err(e),
            }
        }

        let mut dm_devices: BTreeSet<String> = BTreeSet::new();
        for path in &device_paths {
            let device = self.get_multipath_disk(&path.to_string_lossy())?;
            dm_devices.insert(dm_name_of(&device).to_string());
        }

        self.single_dm_device(volume_id, dm_devices)
    }

    /// Resolve a volume to its dm device from the volume id alone.
    ///
    /// Scans both by-path families, resolves every link to its dm device and
    /// keeps the ones whose device-mapper UUID matches the volume WWN carried
    /// in the id.
    fn get_mpath_device_by_volume_uuid(&self, volume_id: &str) -> Result<String> {
        let uuid = volume_uuid(volume_id);
        let wanted_dm_uuid = format!("mpath-3{uuid}");

        let mut device_paths: Vec<PathBuf> = Vec::new();
        for family in [ISCSI_BY_PATH_GLOB, FC_BY_PATH_GLOB] {
            let pattern = format!("{DEV_BY_PATH}/{family}");
            device_paths.extend(self.executor.filepath_glob(&pattern)?);
        }

        let mut dm_devices: BTreeSet<String> = BTreeSet::new();
        for path in &device_paths {
            match self.get_multipath_disk(&path.to_string_lossy()) {
                Ok(device) => {
                    dm_devices.insert(dm_name_of(&device).to_string());
                }
                // A link whose sd has no dm parent cannot back a multipath
                // volume; other volumes' links must not fail this lookup.
                Err(DeviceConnectivityError::MultipleDeviceNotFound { by_path, .. }) => {
                    debug!(by_path = %by_path, "skipping by-path link without a dm parent");
                }
                Err(e) => return Err(e),
            }
        }

        let mut matched: BTreeSet<String> = BTreeSet::new();
        for dm_name in dm_devices {
            let uuid_path = format!("{SYS_BLOCK_PATH}/{dm_name}/dm/uuid");
            match self.executor.read_file(&uuid_path) {
                Ok(content) if content.trim().eq_ignore_ascii_case(&wanted_dm_uuid) => {
                    matched.insert(dm_name);
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(dm = %dm_name, "dm device disappeared while resolving");
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.single_dm_device(volume_id, matched)
    }

    fn single_dm_device(&self, volume_id: &str, dm_devices: BTreeSet<String>) -> Result<String> {
        debug!(volume_id = %volume_id, devices = ?dm_devices, "resolved multipath devices");
        match dm_devices.len() {
            0 => Err(DeviceConnectivityError::MultipathDeviceNotFoundForVolume {
                volume_id: volume_id.to_string(),
            }),
            1 => {
                let dm_name = dm_devices.into_iter().next().unwrap_or_default();
                Ok(format!("{DEV_PATH}/{dm_name}"))
            }
            _ => Err(DeviceConnectivityError::MultipleDmDevices {
                volume_id: volume_id.to_string(),
                devices: dm_devices,
            }),
        }
    }

    /// Flush a multipath map with `multipath -f`, serialized process-wide.
    ///
    /// If the command fails but the device node is already gone, the flush
    /// raced with removal and counts as success.
    pub fn flush_multipath_device(&self, dm_name: &str) -> Result<()> {
        let full_device = format!("{DEV_PATH}/{dm_name}");
        let args = vec!["-f".to_string(), full_device.clone()];

        debug!(device = %full_device, "acquiring multipath flush lock");
        let flush_result = {
            let _guard = self
                .mpath_flush_lock
                .lock()
                .expect("multipath flush lock poisoned");
            self.executor
                .execute_with_timeout(MULTIPATH_FLUSH_TIMEOUT_MS, "multipath", &args)
        };

        let command_err = match flush_result {
            Ok(output) if output.status.success() => {
                debug!(device = %full_device, "flushed multipath device");
                return Ok(());
            }
            Ok(output) => command_failure("multipath", &args, &output),
            Err(e) => e.into(),
        };

        match self.executor.open_file(&full_device) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(device = %full_device, "multipath device already removed, flush not needed");
                Ok(())
            }
            Err(e) => {
                warn!(device = %full_device, error = %e, "multipath device still present and unreadable after failed flush");
                Err(e.into())
            }
            Ok(()) => Err(command_err),
        }
    }

    /// Delete SCSI slave devices by writing `1` to their sysfs delete files.
    /// Devices already gone are skipped; a failed write aborts.
    pub fn remove_physical_device(&self, sys_devices: &[String]) -> Result<()> {
        for device_name in sys_devices {
            if device_name.is_empty() {
                continue;
            }
            let filename = format!("{SYS_BLOCK_PATH}/{device_name}/device/delete");
            match self.executor.write_file(&filename, "1") {
                Ok(_) => {
                    debug!(device = %device_name, "removed physical device");
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(device = %device_name, "block device not found on the system, skipping delete");
                }
                Err(e) => {
                    warn!(file = %filename, error = %e, "failed writing to device delete file");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

impl super::OsDeviceConnectivityHelper for ScsiGenericHelper {
    fn get_mpath_device(&self, volume_id: &str) -> Result<String> {
        self.get_mpath_device_by_volume_uuid(volume_id)
    }

    fn flush_multipath_device(&self, dm_name: &str) -> Result<()> {
        ScsiGenericHelper::flush_multipath_device(self, dm_name)
    }

    fn remove_physical_device(&self, sys_devices: &[String]) -> Result<()> {
        ScsiGenericHelper::remove_physical_device(self, sys_devices)
    }
}
