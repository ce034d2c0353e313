//! Node utilities: publish-context parsing, chroot path mapping, stage-info
//! marker files, sysfs slave enumeration and the expand/format helpers.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::ConfigYaml;
use crate::device_connectivity::{ConnectionType, Executor, FC_HOST_SYSFS_PATH, SYS_BLOCK_PATH};

/// Host-filesystem paths are reached through this prefix when the driver
/// runs inside a container.
pub const PREFIX_CHROOT_OF_HOST_ROOT: &str = "/host";

/// Marker file left in the staging directory by a successful stage.
pub const STAGE_INFO_FILENAME: &str = ".stageInfo";

/// The node's own iSCSI initiator name, as seen through the chroot prefix.
pub const ISCSI_FULL_PATH: &str = "/host/etc/iscsi/initiatorname.iscsi";

/// CSI caps node ids at 192 bytes.
pub const MAX_NODE_ID_LENGTH: usize = 192;

const MULTIPATHD_TIMEOUT_MS: u64 = 60_000;
const RESIZE_FS_TIMEOUT_MS: u64 = 300_000;
const MKFS_TIMEOUT_MS: u64 = 300_000;

#[derive(Error, Debug)]
pub enum NodeUtilsError {
    #[error("invalid publish context: {0}")]
    InvalidPublishContext(String),

    #[error("command '{command}' failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("unsupported filesystem type '{0}'")]
    UnsupportedFilesystem(String),

    #[error("no InitiatorName entry found in '{0}'")]
    InitiatorNotFound(String),

    #[error("no fc ports found under '{0}'")]
    NoFcPorts(String),

    #[error("node id of {length} bytes exceeds the {max} byte limit")]
    NodeIdTooLong { length: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("stage info file error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parsed publish context of a stage request.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishContextInfo {
    pub connectivity_type: ConnectionType,
    pub lun_id: i32,
    /// Array initiator identifier -> portal addresses (empty for FC).
    pub ips_by_array_initiator: HashMap<String, Vec<String>>,
}

/// Contents of the stage-info marker file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInfo {
    pub mpath_device: String,
    pub sys_devices: Vec<String>,
}

#[cfg_attr(test, automock)]
pub trait NodeUtils: Send + Sync {
    /// Parse connectivity type, LUN and initiator/portal map out of the
    /// publish context using the configured parameter names.
    fn get_info_from_publish_context(
        &self,
        publish_context: &HashMap<String, String>,
        config: &ConfigYaml,
    ) -> Result<PublishContextInfo, NodeUtilsError>;

    /// The array-side initiator identifiers, in deterministic order.
    fn get_array_initiators(
        &self,
        ips_by_array_initiator: &HashMap<String, Vec<String>>,
    ) -> Vec<String>;

    /// Map a host path to the pod-visible chrooted path.
    fn get_pod_path(&self, path: &str) -> String;

    fn is_path_exists(&self, path: &str) -> bool;

    fn is_directory(&self, path: &str) -> bool;

    /// `Ok(true)` when nothing is mounted on `path`.
    fn is_not_mount_point(&self, path: &str) -> Result<bool, NodeUtilsError>;

    fn make_dir(&self, path: &str) -> Result<(), NodeUtilsError>;

    fn make_file(&self, path: &str) -> Result<(), NodeUtilsError>;

    fn remove_file_or_directory(&self, path: &str) -> Result<(), NodeUtilsError>;

    fn write_stage_info_file(&self, path: &str, info: &StageInfo) -> Result<(), NodeUtilsError>;

    fn read_stage_info_file(&self, path: &str) -> Result<StageInfo, NodeUtilsError>;

    fn stage_info_file_is_exist(&self, path: &str) -> bool;

    fn clear_stage_info_file(&self, path: &str) -> Result<(), NodeUtilsError>;

    /// The `sd<X>` slaves backing a dm device.
    fn get_sys_devices_from_mpath(&self, dm_name: &str) -> Result<Vec<String>, NodeUtilsError>;

    /// Ask every slave to re-read its size before a multipath resize.
    fn rescan_physical_devices(&self, sys_devices: &[String]) -> Result<(), NodeUtilsError>;

    /// Resize the multipath map after its slaves grew.
    fn expand_mpath_device(&self, dm_name: &str) -> Result<(), NodeUtilsError>;

    /// Grow the filesystem to the new device size.
    fn expand_filesystem(
        &self,
        device: &str,
        mount_path: &str,
        fs_type: &str,
    ) -> Result<(), NodeUtilsError>;

    /// Put a fresh filesystem on a blank device.
    fn format_device(&self, device: &str, fs_type: &str) -> Result<(), NodeUtilsError>;

    fn is_fc_exists(&self) -> bool;

    /// WWPNs of the node's FC ports, without the `0x` prefix.
    fn parse_fc_ports(&self) -> Result<Vec<String>, NodeUtilsError>;

    /// The node's iSCSI initiator name.
    fn parse_iscsi_initiators(&self) -> Result<String, NodeUtilsError>;

    fn generate_node_id(
        &self,
        hostname: &str,
        fc_wwns: &[String],
        iqn: &str,
    ) -> Result<String, NodeUtilsError>;

    fn get_topology_labels(&self, config: &ConfigYaml) -> HashMap<String, String>;
}

/// Production [`NodeUtils`] against the real node.
pub struct SysNodeUtils {
    executor: Arc<dyn Executor>,
}

impl SysNodeUtils {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    fn run_checked(
        &self,
        timeout_ms: u64,
        command: &str,
        args: Vec<String>,
    ) -> Result<(), NodeUtilsError> {
        let output = self
            .executor
            .execute_with_timeout(timeout_ms, command, &args)?;
        if !output.status.success() {
            return Err(NodeUtilsError::CommandFailed {
                command: format!("{command} {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Last path component ("/dev/sda" -> "sda").
fn device_basename(device: &str) -> &str {
    device.rsplit('/').next().unwrap_or(device)
}

impl NodeUtils for SysNodeUtils {
    fn get_info_from_publish_context(
        &self,
        publish_context: &HashMap<String, String>,
        config: &ConfigYaml,
    ) -> Result<PublishContextInfo, NodeUtilsError> {
        let lun_param = &config.node.publish_context_lun_parameter;
        let lun_str = publish_context.get(lun_param).ok_or_else(|| {
            NodeUtilsError::InvalidPublishContext(format!("missing key '{lun_param}'"))
        })?;
        let lun_id: i32 = lun_str.parse().map_err(|_| {
            NodeUtilsError::InvalidPublishContext(format!("'{lun_str}' is not a valid lun"))
        })?;

        let connectivity_param = &config.node.publish_context_connectivity_parameter;
        let connectivity_str = publish_context.get(connectivity_param).ok_or_else(|| {
            NodeUtilsError::InvalidPublishContext(format!("missing key '{connectivity_param}'"))
        })?;
        let connectivity_type: ConnectionType = connectivity_str
            .parse()
            .map_err(|_| {
                NodeUtilsError::InvalidPublishContext(format!(
                    "'{connectivity_str}' is not a supported connectivity type"
                ))
            })?;

        let mut ips_by_array_initiator = HashMap::new();
        match connectivity_type {
            ConnectionType::Iscsi => {
                let iqn_param = &config.node.publish_context_array_iqn_parameter;
                let array_iqns = publish_context.get(iqn_param).ok_or_else(|| {
                    NodeUtilsError::InvalidPublishContext(format!("missing key '{iqn_param}'"))
                })?;
                for array_iqn in array_iqns.split(',').filter(|iqn| !iqn.is_empty()) {
                    let portals = publish_context.get(array_iqn).ok_or_else(|| {
                        NodeUtilsError::InvalidPublishContext(format!(
                            "missing portal list for array iqn '{array_iqn}'"
                        ))
                    })?;
                    ips_by_array_initiator.insert(
                        array_iqn.to_string(),
                        portals
                            .split(',')
                            .filter(|ip| !ip.is_empty())
                            .map(str::to_string)
                            .collect(),
                    );
                }
            }
            ConnectionType::Fc => {
                let fc_param = &config.node.publish_context_fc_initiators_parameter;
                let array_wwpns = publish_context.get(fc_param).ok_or_else(|| {
                    NodeUtilsError::InvalidPublishContext(format!("missing key '{fc_param}'"))
                })?;
                for wwpn in array_wwpns.split(',').filter(|wwpn| !wwpn.is_empty()) {
                    ips_by_array_initiator.insert(wwpn.to_string(), Vec::new());
                }
            }
        }

        if ips_by_array_initiator.is_empty() {
            return Err(NodeUtilsError::InvalidPublishContext(
                "no array initiators in publish context".to_string(),
            ));
        }

        debug!(
            connectivity = %connectivity_type,
            lun = lun_id,
            initiators = ?ips_by_array_initiator.keys().collect::<Vec<_>>(),
            "parsed publish context"
        );
        Ok(PublishContextInfo {
            connectivity_type,
            lun_id,
            ips_by_array_initiator,
        })
    }

    fn get_array_initiators(
        &self,
        ips_by_array_initiator: &HashMap<String, Vec<String>>,
    ) -> Vec<String> {
        let mut initiators: Vec<String> = ips_by_array_initiator.keys().cloned().collect();
        initiators.sort();
        initiators
    }

    fn get_pod_path(&self, path: &str) -> String {
        format!(
            "{PREFIX_CHROOT_OF_HOST_ROOT}/{}",
            path.trim_start_matches('/')
        )
    }

    fn is_path_exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn is_directory(&self, path: &str) -> bool {
        Path::new(path).is_dir()
    }

    fn is_not_mount_point(&self, path: &str) -> Result<bool, NodeUtilsError> {
        let mounts = self.executor.read_file("/proc/mounts")?;
        let mounted = mounts
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(path));
        Ok(!mounted)
    }

    fn make_dir(&self, path: &str) -> Result<(), NodeUtilsError> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn make_file(&self, path: &str) -> Result<(), NodeUtilsError> {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        Ok(())
    }

    fn remove_file_or_directory(&self, path: &str) -> Result<(), NodeUtilsError> {
        let result = if Path::new(path).is_dir() {
            std::fs::remove_dir(path)
        } else {
            std::fs::remove_file(path)
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_stage_info_file(&self, path: &str, info: &StageInfo) -> Result<(), NodeUtilsError> {
        debug!(path = %path, ?info, "writing stage info file");
        let content = serde_json::to_string(info)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn read_stage_info_file(&self, path: &str) -> Result<StageInfo, NodeUtilsError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn stage_info_file_is_exist(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn clear_stage_info_file(&self, path: &str) -> Result<(), NodeUtilsError> {
        debug!(path = %path, "clearing stage info file");
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn get_sys_devices_from_mpath(&self, dm_name: &str) -> Result<Vec<String>, NodeUtilsError> {
        let slaves_dir = format!("{SYS_BLOCK_PATH}/{dm_name}/slaves");
        let slaves = self.executor.read_dir_names(&slaves_dir)?;
        debug!(dm = %dm_name, ?slaves, "read multipath slaves");
        Ok(slaves)
    }

    fn rescan_physical_devices(&self, sys_devices: &[String]) -> Result<(), NodeUtilsError> {
        for device in sys_devices {
            let name = device_basename(device);
            if name.is_empty() {
                continue;
            }
            let filename = format!("{SYS_BLOCK_PATH}/{name}/device/rescan");
            debug!(file = %filename, "rescanning physical device");
            self.executor.write_file(&filename, "1")?;
        }
        Ok(())
    }

    fn expand_mpath_device(&self, dm_name: &str) -> Result<(), NodeUtilsError> {
        info!(dm = %dm_name, "resizing multipath map");
        self.run_checked(
            MULTIPATHD_TIMEOUT_MS,
            "multipathd",
            vec!["resize".to_string(), "map".to_string(), dm_name.to_string()],
        )
    }

    fn expand_filesystem(
        &self,
        device: &str,
        mount_path: &str,
        fs_type: &str,
    ) -> Result<(), NodeUtilsError> {
        info!(device = %device, mount_path = %mount_path, fs_type = %fs_type, "expanding filesystem");
        match fs_type {
            "ext2" | "ext3" | "ext4" => self.run_checked(
                RESIZE_FS_TIMEOUT_MS,
                "resize2fs",
                vec![device.to_string()],
            ),
            // xfs grows online through the mount point
            "xfs" => self.run_checked(
                RESIZE_FS_TIMEOUT_MS,
                "xfs_growfs",
                vec![mount_path.to_string()],
            ),
            other => Err(NodeUtilsError::UnsupportedFilesystem(other.to_string())),
        }
    }

    fn format_device(&self, device: &str, fs_type: &str) -> Result<(), NodeUtilsError> {
        info!(device = %device, fs_type = %fs_type, "formatting blank device");
        let (command, args) = match fs_type {
            "ext2" | "ext3" | "ext4" => (
                format!("mkfs.{fs_type}"),
                vec!["-F".to_string(), device.to_string()],
            ),
            "xfs" => (
                "mkfs.xfs".to_string(),
                vec!["-f".to_string(), device.to_string()],
            ),
            other => (format!("mkfs.{other}"), vec![device.to_string()]),
        };
        self.run_checked(MKFS_TIMEOUT_MS, &command, args)
    }

    fn is_fc_exists(&self) -> bool {
        match self.executor.read_dir_names(FC_HOST_SYSFS_PATH) {
            Ok(entries) => !entries.is_empty(),
            Err(_) => false,
        }
    }

    fn parse_fc_ports(&self) -> Result<Vec<String>, NodeUtilsError> {
        let pattern = format!("{FC_HOST_SYSFS_PATH}/host*/port_name");
        let port_name_paths = self.executor.filepath_glob(&pattern)?;

        let mut wwpns = Vec::new();
        let mut first_error: Option<io::Error> = None;
        for path in &port_name_paths {
            match self.executor.read_file(&path.to_string_lossy()) {
                Ok(content) => {
                    let wwpn = content.trim().trim_start_matches("0x").to_string();
                    if !wwpn.is_empty() {
                        wwpns.push(wwpn);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not read fc port name");
                    first_error.get_or_insert(e);
                }
            }
        }

        if wwpns.is_empty() {
            if let Some(e) = first_error {
                return Err(e.into());
            }
            return Err(NodeUtilsError::NoFcPorts(FC_HOST_SYSFS_PATH.to_string()));
        }
        Ok(wwpns)
    }

    fn parse_iscsi_initiators(&self) -> Result<String, NodeUtilsError> {
        let content = self.executor.read_file(ISCSI_FULL_PATH)?;
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            if let Some(value) = line.strip_prefix("InitiatorName=") {
                return Ok(value.trim().to_string());
            }
        }
        Err(NodeUtilsError::InitiatorNotFound(ISCSI_FULL_PATH.to_string()))
    }

    fn generate_node_id(
        &self,
        hostname: &str,
        fc_wwns: &[String],
        iqn: &str,
    ) -> Result<String, NodeUtilsError> {
        let mut node_id = format!("{hostname};{}", fc_wwns.join(":"));
        if !iqn.is_empty() {
            node_id.push(';');
            node_id.push_str(iqn);
        }
        if node_id.len() > MAX_NODE_ID_LENGTH {
            return Err(NodeUtilsError::NodeIdTooLong {
                length: node_id.len(),
                max: MAX_NODE_ID_LENGTH,
            });
        }
        Ok(node_id)
    }

    fn get_topology_labels(&self, config: &ConfigYaml) -> HashMap<String, String> {
        config.node.topology_segments.clone()
    }
}
