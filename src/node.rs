//! CSI Node Service Implementation
//!
//! Drives the volume lifecycle on the worker node:
//! - Stage: log in to the array, rescan for the LUN, resolve the multipath
//!   device, format if blank and mount at the staging path
//! - Unstage: unmount, flush the multipath map and delete its SCSI slaves
//! - Publish/Unpublish: bind-mount the staged volume (or the raw dm device)
//!   into the pod and back out
//! - Expand: rescan slaves, resize the multipath map and grow the filesystem
//!
//! Every volume RPC runs under a per-volume lock; a concurrent RPC for the
//! same volume is rejected with `Aborted` and retried by the orchestrator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::config::ConfigYaml;
use crate::csi;
use crate::device_connectivity::{
    ConnectionType, DeviceConnectivityError, OsDeviceConnectivity, OsDeviceConnectivityHelper,
};
use crate::metrics;
use crate::mount::NodeMounter;
use crate::node_utils::{ISCSI_FULL_PATH, NodeUtils, STAGE_INFO_FILENAME, StageInfo};
use crate::sync_lock::{SyncLock, VolumeLockGuard};

/// Filesystem used when the capability does not name one.
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// CSI Node Service
///
/// All process-wide state lives here: the per-volume lock set, the
/// connectivity dispatch table, the mount and node-utility seams and the
/// loaded configuration.
pub struct NodeService {
    hostname: String,
    config: ConfigYaml,
    volume_locks: Arc<SyncLock>,
    node_utils: Arc<dyn NodeUtils>,
    mounter: Arc<dyn NodeMounter>,
    connectivity_map: HashMap<ConnectionType, Arc<dyn OsDeviceConnectivity>>,
    connectivity_helper: Arc<dyn OsDeviceConnectivityHelper>,
}

/// Last path component of a device path ("/dev/dm-2" -> "dm-2").
fn device_basename(device: &str) -> &str {
    device.rsplit('/').next().unwrap_or(device)
}

fn stage_info_path_of(staging_path: &str) -> String {
    format!(
        "{}/{STAGE_INFO_FILENAME}",
        staging_path.trim_end_matches('/')
    )
}

fn observe<T>(operation: &str, started: Instant, result: &Result<T, Status>) {
    let status = if result.is_ok() { "success" } else { "error" };
    metrics::record_operation(operation, status, started.elapsed().as_secs_f64());
}

impl NodeService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hostname: String,
        config: ConfigYaml,
        volume_locks: Arc<SyncLock>,
        node_utils: Arc<dyn NodeUtils>,
        mounter: Arc<dyn NodeMounter>,
        connectivity_map: HashMap<ConnectionType, Arc<dyn OsDeviceConnectivity>>,
        connectivity_helper: Arc<dyn OsDeviceConnectivityHelper>,
    ) -> Self {
        Self {
            hostname,
            config,
            volume_locks,
            node_utils,
            mounter,
            connectivity_map,
            connectivity_helper,
        }
    }

    /// Validate that a path is absolute and free of traversal sequences.
    fn validate_path(path: &str) -> Result<(), Status> {
        if !path.starts_with('/') {
            return Err(Status::invalid_argument("path must be absolute"));
        }
        if path.contains("..") {
            return Err(Status::invalid_argument(
                "path cannot contain '..' (path traversal)",
            ));
        }
        Ok(())
    }

    /// Validate presence of the capability and a known access mode.
    fn validate_capability(
        capability: Option<&csi::VolumeCapability>,
    ) -> Result<&csi::VolumeCapability, Status> {
        let capability =
            capability.ok_or_else(|| Status::invalid_argument("volume capability is required"))?;
        let mode = capability
            .access_mode
            .as_ref()
            .map(|access_mode| access_mode.mode)
            .unwrap_or(csi::volume_capability::access_mode::Mode::Unknown as i32);
        if mode == csi::volume_capability::access_mode::Mode::Unknown as i32 {
            return Err(Status::invalid_argument(
                "volume capability access mode is not supported",
            ));
        }
        if capability.access_type.is_none() {
            return Err(Status::invalid_argument(
                "volume capability access type is required",
            ));
        }
        Ok(capability)
    }

    /// Claim the per-volume lock, failing fast on contention.
    fn lock_volume(&self, volume_id: &str) -> Result<VolumeLockGuard, Status> {
        self.volume_locks.lock_volume(volume_id).ok_or_else(|| {
            warn!(volume_id = %volume_id, "another operation is already running for this volume");
            Status::aborted(format!(
                "an operation for volume '{volume_id}' is already in progress"
            ))
        })
    }

    fn internal<E: std::fmt::Display>(error: E) -> Status {
        error!(error = %error, "node operation failed");
        Status::internal(error.to_string())
    }

    pub async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let started = Instant::now();
        let result = self.do_node_stage_volume(request);
        observe("node_stage_volume", started, &result);
        result
    }

    fn do_node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id is required"));
        }
        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument("staging target path is required"));
        }
        Self::validate_path(&req.staging_target_path)?;

        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            "NodeStageVolume request"
        );

        let capability = Self::validate_capability(req.volume_capability.as_ref())?;

        let context_info = self
            .node_utils
            .get_info_from_publish_context(&req.publish_context, &self.config)
            .map_err(|e| {
                error!(error = %e, "failed parsing publish context");
                Status::invalid_argument(e.to_string())
            })?;

        let _guard = self.lock_volume(&req.volume_id)?;

        let staging_path = self.node_utils.get_pod_path(&req.staging_target_path);
        if !self.node_utils.is_path_exists(&staging_path) {
            self.node_utils
                .make_dir(&staging_path)
                .map_err(Self::internal)?;
        }

        let connectivity = self
            .connectivity_map
            .get(&context_info.connectivity_type)
            .ok_or_else(|| {
                Status::internal(format!(
                    "no connectivity handler for '{}'",
                    context_info.connectivity_type
                ))
            })?;

        let array_initiators = self
            .node_utils
            .get_array_initiators(&context_info.ips_by_array_initiator);
        connectivity
            .ensure_login(&context_info.ips_by_array_initiator)
            .map_err(Self::internal)?;
        connectivity
            .rescan_devices(context_info.lun_id, &array_initiators)
            .map_err(Self::internal)?;
        let mpath_device = connectivity
            .get_mpath_device(&req.volume_id, context_info.lun_id, &array_initiators)
            .map_err(Self::internal)?;
        let dm_name = device_basename(&mpath_device).to_string();
        debug!(volume_id = %req.volume_id, device = %mpath_device, "resolved multipath device");

        match capability.access_type.as_ref() {
            Some(csi::volume_capability::AccessType::Mount(mount_capability)) => {
                let fs_type = if mount_capability.fs_type.is_empty() {
                    DEFAULT_FS_TYPE
                } else {
                    mount_capability.fs_type.as_str()
                };

                let existing_format = self.mounter.get_disk_format(&mpath_device)?;
                if !existing_format.is_empty() && existing_format != fs_type {
                    return Err(Status::already_exists(format!(
                        "volume is formatted as '{existing_format}' but '{fs_type}' was requested"
                    )));
                }

                if !self
                    .node_utils
                    .is_not_mount_point(&staging_path)
                    .map_err(Self::internal)?
                {
                    if self.node_utils.is_directory(&staging_path) {
                        info!(
                            volume_id = %req.volume_id,
                            staging_target_path = %req.staging_target_path,
                            "volume already staged"
                        );
                        return Ok(Response::new(csi::NodeStageVolumeResponse {}));
                    }
                    return Err(Status::already_exists(
                        "staging target path is occupied by a non-directory mount",
                    ));
                }

                if existing_format.is_empty() {
                    self.node_utils
                        .format_device(&mpath_device, fs_type)
                        .map_err(Self::internal)?;
                }
                self.mounter.format_and_mount(
                    &mpath_device,
                    &req.staging_target_path,
                    fs_type,
                    &[],
                )?;
            }
            Some(csi::volume_capability::AccessType::Block(_)) => {
                // Raw block volumes are bind-mounted straight from the dm
                // device at publish time.
                debug!(volume_id = %req.volume_id, "raw block volume, no staging mount");
            }
            None => {
                return Err(Status::invalid_argument(
                    "volume capability access type is required",
                ));
            }
        }

        let sys_devices = self
            .node_utils
            .get_sys_devices_from_mpath(&dm_name)
            .map_err(Self::internal)?;
        let stage_info = StageInfo {
            mpath_device: dm_name,
            sys_devices,
        };
        self.node_utils
            .write_stage_info_file(&stage_info_path_of(&staging_path), &stage_info)
            .map_err(Self::internal)?;

        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            device = %mpath_device,
            "volume staged successfully"
        );
        Ok(Response::new(csi::NodeStageVolumeResponse {}))
    }

    pub async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let started = Instant::now();
        let result = self.do_node_unstage_volume(request);
        observe("node_unstage_volume", started, &result);
        result
    }

    fn do_node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id is required"));
        }
        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument("staging target path is required"));
        }
        Self::validate_path(&req.staging_target_path)?;

        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            "NodeUnstageVolume request"
        );

        let _guard = self.lock_volume(&req.volume_id)?;

        let staging_path = self.node_utils.get_pod_path(&req.staging_target_path);
        if !self
            .node_utils
            .is_not_mount_point(&staging_path)
            .map_err(Self::internal)?
        {
            self.mounter.unmount(&req.staging_target_path)?;
        }

        match self.connectivity_helper.get_mpath_device(&req.volume_id) {
            Ok(mpath_device) => {
                let dm_name = device_basename(&mpath_device).to_string();
                let sys_devices = self
                    .node_utils
                    .get_sys_devices_from_mpath(&dm_name)
                    .map_err(Self::internal)?;
                self.connectivity_helper
                    .flush_multipath_device(&dm_name)
                    .map_err(Self::internal)?;
                self.connectivity_helper
                    .remove_physical_device(&sys_devices)
                    .map_err(Self::internal)?;
            }
            Err(DeviceConnectivityError::MultipathDeviceNotFoundForVolume { .. }) => {
                info!(
                    volume_id = %req.volume_id,
                    "multipath device already gone, unstage is idempotent"
                );
            }
            Err(e) => return Err(Self::internal(e)),
        }

        let stage_info_path = stage_info_path_of(&staging_path);
        if self.node_utils.stage_info_file_is_exist(&stage_info_path) {
            self.node_utils
                .clear_stage_info_file(&stage_info_path)
                .map_err(Self::internal)?;
        }

        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            "volume unstaged successfully"
        );
        Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
    }

    pub async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let started = Instant::now();
        let result = self.do_node_publish_volume(request);
        observe("node_publish_volume", started, &result);
        result
    }

    fn do_node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id is required"));
        }
        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument("staging target path is required"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("target path is required"));
        }
        Self::validate_path(&req.target_path)?;
        let capability = Self::validate_capability(req.volume_capability.as_ref())?;

        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            target_path = %req.target_path,
            "NodePublishVolume request"
        );

        let _guard = self.lock_volume(&req.volume_id)?;

        let target_path = self.node_utils.get_pod_path(&req.target_path);
        match capability.access_type.as_ref() {
            Some(csi::volume_capability::AccessType::Mount(mount_capability)) => {
                if self.node_utils.is_path_exists(&target_path) {
                    if !self
                        .node_utils
                        .is_not_mount_point(&target_path)
                        .map_err(Self::internal)?
                    {
                        if self.node_utils.is_directory(&target_path) {
                            info!(target_path = %req.target_path, "volume already published");
                            return Ok(Response::new(csi::NodePublishVolumeResponse {}));
                        }
                        return Err(Status::already_exists(
                            "target path is occupied by a non-directory mount",
                        ));
                    }
                } else {
                    self.node_utils
                        .make_dir(&target_path)
                        .map_err(Self::internal)?;
                }
                self.mounter.mount(
                    &req.staging_target_path,
                    &req.target_path,
                    &mount_capability.fs_type,
                    &["bind".to_string()],
                )?;
            }
            Some(csi::volume_capability::AccessType::Block(_)) => {
                if self.node_utils.is_path_exists(&target_path) {
                    if !self
                        .node_utils
                        .is_not_mount_point(&target_path)
                        .map_err(Self::internal)?
                    {
                        if !self.node_utils.is_directory(&target_path) {
                            info!(target_path = %req.target_path, "block volume already published");
                            return Ok(Response::new(csi::NodePublishVolumeResponse {}));
                        }
                        return Err(Status::already_exists(
                            "target path is occupied by a directory mount",
                        ));
                    }
                } else {
                    self.node_utils
                        .make_file(&target_path)
                        .map_err(Self::internal)?;
                }
                let mpath_device = self
                    .connectivity_helper
                    .get_mpath_device(&req.volume_id)
                    .map_err(Self::internal)?;
                self.mounter.mount(
                    &mpath_device,
                    &req.target_path,
                    "",
                    &["bind".to_string()],
                )?;
            }
            None => {
                return Err(Status::invalid_argument(
                    "volume capability access type is required",
                ));
            }
        }

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "volume published successfully"
        );
        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    pub async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let started = Instant::now();
        let result = self.do_node_unpublish_volume(request);
        observe("node_unpublish_volume", started, &result);
        result
    }

    fn do_node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id is required"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("target path is required"));
        }
        Self::validate_path(&req.target_path)?;

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "NodeUnpublishVolume request"
        );

        let _guard = self.lock_volume(&req.volume_id)?;

        let target_path = self.node_utils.get_pod_path(&req.target_path);
        if !self.node_utils.is_path_exists(&target_path) {
            info!(target_path = %req.target_path, "target path does not exist, unpublish is idempotent");
            return Ok(Response::new(csi::NodeUnpublishVolumeResponse {}));
        }
        if !self
            .node_utils
            .is_not_mount_point(&target_path)
            .map_err(Self::internal)?
        {
            self.mounter.unmount(&req.target_path)?;
        }
        self.node_utils
            .remove_file_or_directory(&target_path)
            .map_err(Self::internal)?;

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "volume unpublished successfully"
        );
        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    pub async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let started = Instant::now();
        let result = self.do_node_expand_volume(request);
        observe("node_expand_volume", started, &result);
        result
    }

    fn do_node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id is required"));
        }
        if req.volume_path.is_empty() {
            return Err(Status::invalid_argument("volume path is required"));
        }

        info!(
            volume_id = %req.volume_id,
            volume_path = %req.volume_path,
            "NodeExpandVolume request"
        );

        let _guard = self.lock_volume(&req.volume_id)?;

        let mpath_device = self
            .connectivity_helper
            .get_mpath_device(&req.volume_id)
            .map_err(Self::internal)?;
        let dm_name = device_basename(&mpath_device).to_string();

        let sys_devices = self
            .node_utils
            .get_sys_devices_from_mpath(&dm_name)
            .map_err(Self::internal)?;
        self.node_utils
            .rescan_physical_devices(&sys_devices)
            .map_err(Self::internal)?;
        self.node_utils
            .expand_mpath_device(&dm_name)
            .map_err(Self::internal)?;

        let fs_type = self.mounter.get_disk_format(&mpath_device)?;
        if !fs_type.is_empty() {
            let mount_path = if req.staging_target_path.is_empty() {
                &req.volume_path
            } else {
                &req.staging_target_path
            };
            self.node_utils
                .expand_filesystem(&mpath_device, mount_path, &fs_type)
                .map_err(Self::internal)?;
        }

        info!(volume_id = %req.volume_id, device = %mpath_device, "volume expanded successfully");
        Ok(Response::new(csi::NodeExpandVolumeResponse {
            capacity_bytes: req
                .capacity_range
                .map(|range| range.required_bytes)
                .unwrap_or(0),
        }))
    }

    pub async fn node_get_info(
        &self,
        request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        let _req = request.into_inner();
        info!(hostname = %self.hostname, "NodeGetInfo request");

        let topology_segments = self.node_utils.get_topology_labels(&self.config);

        let fc_exists = self.node_utils.is_fc_exists();
        let fc_wwns = if fc_exists {
            self.node_utils.parse_fc_ports().map_err(Self::internal)?
        } else {
            Vec::new()
        };

        let iscsi_exists = self.node_utils.is_path_exists(ISCSI_FULL_PATH);
        let iqn = if iscsi_exists {
            self.node_utils
                .parse_iscsi_initiators()
                .map_err(Self::internal)?
        } else {
            String::new()
        };

        if !fc_exists && !iscsi_exists {
            return Err(Status::internal("Cannot find valid fc wwns or iscsi iqn"));
        }

        let node_id = self
            .node_utils
            .generate_node_id(&self.hostname, &fc_wwns, &iqn)
            .map_err(Self::internal)?;

        info!(node_id = %node_id, "node identity resolved");
        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id,
            max_volumes_per_node: 0,
            accessible_topology: Some(csi::Topology {
                segments: topology_segments,
            }),
        }))
    }

    pub async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        let capabilities = vec![
            csi::NodeServiceCapability {
                r#type: Some(csi::node_service_capability::Type::Rpc(
                    csi::node_service_capability::Rpc {
                        r#type: csi::node_service_capability::rpc::Type::StageUnstageVolume as i32,
                    },
                )),
            },
            csi::NodeServiceCapability {
                r#type: Some(csi::node_service_capability::Type::Rpc(
                    csi::node_service_capability::Rpc {
                        r#type: csi::node_service_capability::rpc::Type::ExpandVolume as i32,
                    },
                )),
            },
        ];

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    pub async fn node_get_volume_stats(
        &self,
        _request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented("NodeGetVolumeStats is not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_connectivity::{
        MockOsDeviceConnectivity, MockOsDeviceConnectivityHelper,
    };
    use crate::mount::MockNodeMounter;
    use crate::node_utils::{MockNodeUtils, NodeUtilsError, PublishContextInfo};
    use tonic::Code;

    const VOL_ID: &str = "vol-test";
    const STAGING_PATH: &str = "/test/path";
    const STAGING_PATH_PREFIXED: &str = "/host/test/path";
    const TARGET_PATH: &str = "/test/publish/path";
    const TARGET_PATH_PREFIXED: &str = "/host/test/publish/path";
    const ARRAY_IQN: &str = "iqn.1994-05.com.redhat:686358c930fe";
    const MPATH_DEVICE: &str = "/dev/dm-2";

    struct Mocks {
        node_utils: MockNodeUtils,
        mounter: MockNodeMounter,
        connectivity: MockOsDeviceConnectivity,
        helper: MockOsDeviceConnectivityHelper,
    }

    impl Mocks {
        fn new() -> Self {
            Self {
                node_utils: MockNodeUtils::new(),
                mounter: MockNodeMounter::new(),
                connectivity: MockOsDeviceConnectivity::new(),
                helper: MockOsDeviceConnectivityHelper::new(),
            }
        }
    }

    fn build_service(mocks: Mocks) -> (NodeService, Arc<SyncLock>) {
        let locks = Arc::new(SyncLock::new());
        let mut connectivity_map: HashMap<ConnectionType, Arc<dyn OsDeviceConnectivity>> =
            HashMap::new();
        connectivity_map.insert(ConnectionType::Iscsi, Arc::new(mocks.connectivity));
        let service = NodeService::new(
            "test-host".to_string(),
            ConfigYaml::default(),
            locks.clone(),
            Arc::new(mocks.node_utils),
            Arc::new(mocks.mounter),
            connectivity_map,
            Arc::new(mocks.helper),
        );
        (service, locks)
    }

    fn assert_code<T: std::fmt::Debug>(result: Result<T, Status>, code: Code) {
        match result {
            Err(status) => assert_eq!(status.code(), code, "unexpected status: {status:?}"),
            Ok(response) => panic!("expected {code:?}, got success: {response:?}"),
        }
    }

    fn mount_capability(fs_type: &str) -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume {
                    fs_type: fs_type.to_string(),
                    mount_flags: Vec::new(),
                },
            )),
            access_mode: Some(csi::volume_capability::AccessMode {
                mode: csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32,
            }),
        }
    }

    fn block_capability() -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Block(
                csi::volume_capability::BlockVolume {},
            )),
            access_mode: Some(csi::volume_capability::AccessMode {
                mode: csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32,
            }),
        }
    }

    fn unknown_mode_capability() -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: None,
            access_mode: Some(csi::volume_capability::AccessMode {
                mode: csi::volume_capability::access_mode::Mode::Unknown as i32,
            }),
        }
    }

    fn publish_context() -> HashMap<String, String> {
        let mut context = HashMap::new();
        context.insert("PUBLISH_CONTEXT_LUN".to_string(), "1".to_string());
        context.insert(
            "PUBLISH_CONTEXT_CONNECTIVITY".to_string(),
            "iscsi".to_string(),
        );
        context.insert("PUBLISH_CONTEXT_ARRAY_IQN".to_string(), ARRAY_IQN.to_string());
        context.insert(ARRAY_IQN.to_string(), "1.2.3.4,[::1]".to_string());
        context
    }

    fn context_info() -> PublishContextInfo {
        let mut ips = HashMap::new();
        ips.insert(
            ARRAY_IQN.to_string(),
            vec!["1.2.3.4".to_string(), "[::1]".to_string()],
        );
        PublishContextInfo {
            connectivity_type: ConnectionType::Iscsi,
            lun_id: 1,
            ips_by_array_initiator: ips,
        }
    }

    fn stage_request() -> csi::NodeStageVolumeRequest {
        csi::NodeStageVolumeRequest {
            volume_id: VOL_ID.to_string(),
            publish_context: publish_context(),
            staging_target_path: STAGING_PATH.to_string(),
            volume_capability: Some(mount_capability("ext4")),
            ..Default::default()
        }
    }

    /// Wire up everything a stage needs through the connectivity handshake.
    fn expect_staging_prologue(mocks: &mut Mocks) {
        mocks
            .node_utils
            .expect_get_pod_path()
            .returning(|path| format!("/host{path}"));
        mocks
            .node_utils
            .expect_is_path_exists()
            .withf(|path| path == STAGING_PATH_PREFIXED)
            .returning(|_| true);
        mocks
            .node_utils
            .expect_get_info_from_publish_context()
            .returning(|_, _| Ok(context_info()));
        mocks
            .node_utils
            .expect_get_array_initiators()
            .returning(|_| vec![ARRAY_IQN.to_string()]);
        mocks.connectivity.expect_ensure_login().returning(|_| Ok(()));
        mocks
            .connectivity
            .expect_rescan_devices()
            .withf(|lun, initiators| *lun == 1 && initiators == [ARRAY_IQN.to_string()])
            .returning(|_, _| Ok(()));
        mocks
            .connectivity
            .expect_get_mpath_device()
            .withf(|volume_id, lun, initiators| {
                volume_id == VOL_ID && *lun == 1 && initiators == [ARRAY_IQN.to_string()]
            })
            .returning(|_, _, _| Ok(MPATH_DEVICE.to_string()));
    }

    #[tokio::test]
    async fn test_stage_fail_no_volume_id() {
        let (service, _locks) = build_service(Mocks::new());
        let mut request = stage_request();
        request.volume_id = String::new();

        let result = service.node_stage_volume(Request::new(request)).await;
        assert_code(result, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_stage_fail_no_staging_target_path() {
        let (service, _locks) = build_service(Mocks::new());
        let mut request = stage_request();
        request.staging_target_path = String::new();

        let result = service.node_stage_volume(Request::new(request)).await;
        assert_code(result, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_stage_fail_no_volume_capability() {
        // Validation must reject the request before any staging-path work.
        let (service, _locks) = build_service(Mocks::new());

        let mut request = stage_request();
        request.volume_capability = None;

        let result = service.node_stage_volume(Request::new(request)).await;
        assert_code(result, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_stage_fail_unknown_access_mode() {
        let (service, _locks) = build_service(Mocks::new());

        let mut request = stage_request();
        request.volume_capability = Some(unknown_mode_capability());

        let result = service.node_stage_volume(Request::new(request)).await;
        assert_code(result, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_stage_fail_bad_publish_context() {
        let mut mocks = Mocks::new();
        mocks
            .node_utils
            .expect_get_info_from_publish_context()
            .returning(|_, _| {
                Err(NodeUtilsError::InvalidPublishContext(
                    "missing portal list".to_string(),
                ))
            });
        // No make_dir expectation: a malformed request leaves no trace on
        // disk.
        let (service, _locks) = build_service(mocks);

        let result = service
            .node_stage_volume(Request::new(stage_request()))
            .await;
        assert_code(result, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_stage_fail_rescan_devices() {
        let mut mocks = Mocks::new();
        mocks
            .node_utils
            .expect_get_pod_path()
            .returning(|path| format!("/host{path}"));
        mocks
            .node_utils
            .expect_is_path_exists()
            .returning(|_| true);
        mocks
            .node_utils
            .expect_get_info_from_publish_context()
            .returning(|_, _| Ok(context_info()));
        mocks
            .node_utils
            .expect_get_array_initiators()
            .returning(|_| vec![ARRAY_IQN.to_string()]);
        mocks.connectivity.expect_ensure_login().returning(|_| Ok(()));
        mocks
            .connectivity
            .expect_rescan_devices()
            .returning(|_, _| {
                Err(DeviceConnectivityError::NothingWasWrittenToScanFile(
                    "/sys/class/scsi_host/host3/scan".to_string(),
                ))
            });
        let (service, _locks) = build_service(mocks);

        let result = service
            .node_stage_volume(Request::new(stage_request()))
            .await;
        assert_code(result, Code::Internal);
    }

    #[tokio::test]
    async fn test_stage_success_new_filesystem() {
        let mut mocks = Mocks::new();
        expect_staging_prologue(&mut mocks);
        mocks
            .mounter
            .expect_get_disk_format()
            .withf(|device| device == MPATH_DEVICE)
            .returning(|_| Ok(String::new()));
        mocks
            .node_utils
            .expect_is_not_mount_point()
            .withf(|path| path == STAGING_PATH_PREFIXED)
            .returning(|_| Ok(true));
        mocks
            .node_utils
            .expect_format_device()
            .withf(|device, fs_type| device == MPATH_DEVICE && fs_type == "ext4")
            .times(1)
            .returning(|_, _| Ok(()));
        mocks
            .mounter
            .expect_format_and_mount()
            .withf(|device, target, fs_type, options| {
                device == MPATH_DEVICE
                    && target == STAGING_PATH
                    && fs_type == "ext4"
                    && options.is_empty()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        mocks
            .node_utils
            .expect_get_sys_devices_from_mpath()
            .withf(|dm_name| dm_name == "dm-2")
            .returning(|_| Ok(vec!["sda".to_string(), "sdb".to_string()]));
        mocks
            .node_utils
            .expect_write_stage_info_file()
            .withf(|path, stage_info| {
                path == "/host/test/path/.stageInfo" && stage_info.mpath_device == "dm-2"
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let (service, _locks) = build_service(mocks);

        service
            .node_stage_volume(Request::new(stage_request()))
            .await
            .expect("stage should succeed");
    }

    #[tokio::test]
    async fn test_stage_success_already_formatted() {
        let mut mocks = Mocks::new();
        expect_staging_prologue(&mut mocks);
        mocks
            .mounter
            .expect_get_disk_format()
            .returning(|_| Ok("ext4".to_string()));
        mocks
            .node_utils
            .expect_is_not_mount_point()
            .returning(|_| Ok(true));
        // No format_device expectation: the device must not be re-formatted.
        mocks
            .mounter
            .expect_format_and_mount()
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        mocks
            .node_utils
            .expect_get_sys_devices_from_mpath()
            .returning(|_| Ok(vec!["sda".to_string()]));
        mocks
            .node_utils
            .expect_write_stage_info_file()
            .returning(|_, _| Ok(()));
        let (service, _locks) = build_service(mocks);

        service
            .node_stage_volume(Request::new(stage_request()))
            .await
            .expect("stage should succeed");
    }

    #[tokio::test]
    async fn test_stage_success_idempotent_already_mounted() {
        let mut mocks = Mocks::new();
        expect_staging_prologue(&mut mocks);
        mocks
            .mounter
            .expect_get_disk_format()
            .returning(|_| Ok("ext4".to_string()));
        mocks
            .node_utils
            .expect_is_not_mount_point()
            .returning(|_| Ok(false));
        mocks
            .node_utils
            .expect_is_directory()
            .returning(|_| true);
        // No mount or format expectations: repeats must be side-effect free.
        let (service, _locks) = build_service(mocks);

        service
            .node_stage_volume(Request::new(stage_request()))
            .await
            .expect("idempotent stage should succeed");
    }

    #[tokio::test]
    async fn test_stage_fail_fs_type_mismatch() {
        let mut mocks = Mocks::new();
        expect_staging_prologue(&mut mocks);
        mocks
            .mounter
            .expect_get_disk_format()
            .returning(|_| Ok("xfs".to_string()));
        let (service, _locks) = build_service(mocks);

        let result = service
            .node_stage_volume(Request::new(stage_request()))
            .await;
        assert_code(result, Code::AlreadyExists);
    }

    #[tokio::test]
    async fn test_unstage_fail_missing_inputs() {
        let (service, _locks) = build_service(Mocks::new());

        let result = service
            .node_unstage_volume(Request::new(csi::NodeUnstageVolumeRequest {
                volume_id: String::new(),
                staging_target_path: STAGING_PATH.to_string(),
            }))
            .await;
        assert_code(result, Code::InvalidArgument);

        let result = service
            .node_unstage_volume(Request::new(csi::NodeUnstageVolumeRequest {
                volume_id: VOL_ID.to_string(),
                staging_target_path: String::new(),
            }))
            .await;
        assert_code(result, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_unstage_success_normal() {
        let mut mocks = Mocks::new();
        mocks
            .node_utils
            .expect_get_pod_path()
            .returning(|path| format!("/host{path}"));
        mocks
            .node_utils
            .expect_is_not_mount_point()
            .returning(|_| Ok(false));
        mocks
            .mounter
            .expect_unmount()
            .withf(|target| target == STAGING_PATH)
            .times(1)
            .returning(|_| Ok(()));
        mocks
            .helper
            .expect_get_mpath_device()
            .withf(|volume_id| volume_id == VOL_ID)
            .returning(|_| Ok(MPATH_DEVICE.to_string()));
        mocks
            .node_utils
            .expect_get_sys_devices_from_mpath()
            .withf(|dm_name| dm_name == "dm-2")
            .returning(|_| Ok(vec!["sda".to_string(), "sdb".to_string()]));
        mocks
            .helper
            .expect_flush_multipath_device()
            .withf(|dm_name| dm_name == "dm-2")
            .times(1)
            .returning(|_| Ok(()));
        mocks
            .helper
            .expect_remove_physical_device()
            .withf(|sys_devices| sys_devices == ["sda".to_string(), "sdb".to_string()])
            .times(1)
            .returning(|_| Ok(()));
        mocks
            .node_utils
            .expect_stage_info_file_is_exist()
            .returning(|_| true);
        mocks
            .node_utils
            .expect_clear_stage_info_file()
            .withf(|path| path == "/host/test/path/.stageInfo")
            .times(1)
            .returning(|_| Ok(()));
        let (service, _locks) = build_service(mocks);

        service
            .node_unstage_volume(Request::new(csi::NodeUnstageVolumeRequest {
                volume_id: VOL_ID.to_string(),
                staging_target_path: STAGING_PATH.to_string(),
            }))
            .await
            .expect("unstage should succeed");
    }

    #[tokio::test]
    async fn test_unstage_success_device_already_gone() {
        let mut mocks = Mocks::new();
        mocks
            .node_utils
            .expect_get_pod_path()
            .returning(|path| format!("/host{path}"));
        mocks
            .node_utils
            .expect_is_not_mount_point()
            .returning(|_| Ok(true));
        mocks.helper.expect_get_mpath_device().returning(|volume_id| {
            Err(DeviceConnectivityError::MultipathDeviceNotFoundForVolume {
                volume_id: volume_id.to_string(),
            })
        });
        // No flush or slave-removal expectations: the device is gone.
        mocks
            .node_utils
            .expect_stage_info_file_is_exist()
            .returning(|_| false);
        let (service, _locks) = build_service(mocks);

        service
            .node_unstage_volume(Request::new(csi::NodeUnstageVolumeRequest {
                volume_id: VOL_ID.to_string(),
                staging_target_path: STAGING_PATH.to_string(),
            }))
            .await
            .expect("idempotent unstage should succeed");
    }

    #[tokio::test]
    async fn test_unstage_fail_flush_error() {
        let mut mocks = Mocks::new();
        mocks
            .node_utils
            .expect_get_pod_path()
            .returning(|path| format!("/host{path}"));
        mocks
            .node_utils
            .expect_is_not_mount_point()
            .returning(|_| Ok(true));
        mocks
            .helper
            .expect_get_mpath_device()
            .returning(|_| Ok(MPATH_DEVICE.to_string()));
        mocks
            .node_utils
            .expect_get_sys_devices_from_mpath()
            .returning(|_| Ok(vec!["sda".to_string()]));
        mocks
            .helper
            .expect_flush_multipath_device()
            .returning(|_| {
                Err(DeviceConnectivityError::CommandFailed {
                    command: "multipath -f /dev/dm-2".to_string(),
                    stderr: "map in use".to_string(),
                })
            });
        let (service, _locks) = build_service(mocks);

        let result = service
            .node_unstage_volume(Request::new(csi::NodeUnstageVolumeRequest {
                volume_id: VOL_ID.to_string(),
                staging_target_path: STAGING_PATH.to_string(),
            }))
            .await;
        assert_code(result, Code::Internal);
    }

    fn publish_request(capability: csi::VolumeCapability) -> csi::NodePublishVolumeRequest {
        csi::NodePublishVolumeRequest {
            volume_id: VOL_ID.to_string(),
            staging_target_path: STAGING_PATH.to_string(),
            target_path: TARGET_PATH.to_string(),
            volume_capability: Some(capability),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_publish_fail_missing_inputs() {
        let (service, _locks) = build_service(Mocks::new());

        let mut request = publish_request(mount_capability("ext4"));
        request.volume_id = String::new();
        let result = service.node_publish_volume(Request::new(request)).await;
        assert_code(result, Code::InvalidArgument);

        let mut request = publish_request(mount_capability("ext4"));
        request.staging_target_path = String::new();
        let result = service.node_publish_volume(Request::new(request)).await;
        assert_code(result, Code::InvalidArgument);

        let mut request = publish_request(mount_capability("ext4"));
        request.target_path = String::new();
        let result = service.node_publish_volume(Request::new(request)).await;
        assert_code(result, Code::InvalidArgument);

        let mut request = publish_request(mount_capability("ext4"));
        request.volume_capability = None;
        let result = service.node_publish_volume(Request::new(request)).await;
        assert_code(result, Code::InvalidArgument);

        let result = service
            .node_publish_volume(Request::new(publish_request(unknown_mode_capability())))
            .await;
        assert_code(result, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_publish_success_filesystem() {
        let mut mocks = Mocks::new();
        mocks
            .node_utils
            .expect_get_pod_path()
            .returning(|path| format!("/host{path}"));
        mocks
            .node_utils
            .expect_is_path_exists()
            .withf(|path| path == TARGET_PATH_PREFIXED)
            .returning(|_| false);
        mocks
            .node_utils
            .expect_make_dir()
            .withf(|path| path == TARGET_PATH_PREFIXED)
            .times(1)
            .returning(|_| Ok(()));
        mocks
            .mounter
            .expect_mount()
            .withf(|source, target, fs_type, options| {
                source == STAGING_PATH
                    && target == TARGET_PATH
                    && fs_type == "ext4"
                    && options == ["bind".to_string()]
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let (service, _locks) = build_service(mocks);

        service
            .node_publish_volume(Request::new(publish_request(mount_capability("ext4"))))
            .await
            .expect("publish should succeed");
    }

    #[tokio::test]
    async fn test_publish_idempotent_filesystem() {
        let mut mocks = Mocks::new();
        mocks
            .node_utils
            .expect_get_pod_path()
            .returning(|path| format!("/host{path}"));
        mocks
            .node_utils
            .expect_is_path_exists()
            .returning(|_| true);
        mocks
            .node_utils
            .expect_is_not_mount_point()
            .returning(|_| Ok(false));
        mocks
            .node_utils
            .expect_is_directory()
            .returning(|_| true);
        let (service, _locks) = build_service(mocks);

        service
            .node_publish_volume(Request::new(publish_request(mount_capability("ext4"))))
            .await
            .expect("idempotent publish should succeed");
    }

    #[tokio::test]
    async fn test_publish_fail_wrong_kind_already_mounted() {
        let mut mocks = Mocks::new();
        mocks
            .node_utils
            .expect_get_pod_path()
            .returning(|path| format!("/host{path}"));
        mocks
            .node_utils
            .expect_is_path_exists()
            .returning(|_| true);
        mocks
            .node_utils
            .expect_is_not_mount_point()
            .returning(|_| Ok(false));
        mocks
            .node_utils
            .expect_is_directory()
            .returning(|_| false);
        let (service, _locks) = build_service(mocks);

        let result = service
            .node_publish_volume(Request::new(publish_request(mount_capability("ext4"))))
            .await;
        assert_code(result, Code::AlreadyExists);
    }

    #[tokio::test]
    async fn test_publish_success_raw_block() {
        let mut mocks = Mocks::new();
        mocks
            .node_utils
            .expect_get_pod_path()
            .returning(|path| format!("/host{path}"));
        mocks
            .node_utils
            .expect_is_path_exists()
            .returning(|_| false);
        mocks
            .node_utils
            .expect_make_file()
            .withf(|path| path == TARGET_PATH_PREFIXED)
            .times(1)
            .returning(|_| Ok(()));
        mocks
            .helper
            .expect_get_mpath_device()
            .withf(|volume_id| volume_id == VOL_ID)
            .returning(|_| Ok(MPATH_DEVICE.to_string()));
        mocks
            .mounter
            .expect_mount()
            .withf(|source, target, fs_type, options| {
                source == MPATH_DEVICE
                    && target == TARGET_PATH
                    && fs_type.is_empty()
                    && options == ["bind".to_string()]
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let (service, _locks) = build_service(mocks);

        service
            .node_publish_volume(Request::new(publish_request(block_capability())))
            .await
            .expect("block publish should succeed");
    }

    #[tokio::test]
    async fn test_unpublish_success_and_idempotent() {
        let mut mocks = Mocks::new();
        mocks
            .node_utils
            .expect_get_pod_path()
            .returning(|path| format!("/host{path}"));
        mocks
            .node_utils
            .expect_is_path_exists()
            .returning(|_| true);
        mocks
            .node_utils
            .expect_is_not_mount_point()
            .returning(|_| Ok(false));
        mocks
            .mounter
            .expect_unmount()
            .withf(|target| target == TARGET_PATH)
            .times(1)
            .returning(|_| Ok(()));
        mocks
            .node_utils
            .expect_remove_file_or_directory()
            .withf(|path| path == TARGET_PATH_PREFIXED)
            .times(1)
            .returning(|_| Ok(()));
        let (service, _locks) = build_service(mocks);

        service
            .node_unpublish_volume(Request::new(csi::NodeUnpublishVolumeRequest {
                volume_id: VOL_ID.to_string(),
                target_path: TARGET_PATH.to_string(),
            }))
            .await
            .expect("unpublish should succeed");

        // Second service where the target no longer exists: still success.
        let mut mocks = Mocks::new();
        mocks
            .node_utils
            .expect_get_pod_path()
            .returning(|path| format!("/host{path}"));
        mocks
            .node_utils
            .expect_is_path_exists()
            .returning(|_| false);
        let (service, _locks) = build_service(mocks);

        service
            .node_unpublish_volume(Request::new(csi::NodeUnpublishVolumeRequest {
                volume_id: VOL_ID.to_string(),
                target_path: TARGET_PATH.to_string(),
            }))
            .await
            .expect("idempotent unpublish should succeed");
    }

    fn expand_request() -> csi::NodeExpandVolumeRequest {
        csi::NodeExpandVolumeRequest {
            volume_id: format!("someStorageType:{VOL_ID}"),
            volume_path: STAGING_PATH.to_string(),
            staging_target_path: "/staging/test/path".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_expand_fail_missing_inputs() {
        let (service, _locks) = build_service(Mocks::new());

        let mut request = expand_request();
        request.volume_id = String::new();
        let result = service.node_expand_volume(Request::new(request)).await;
        assert_code(result, Code::InvalidArgument);

        let mut request = expand_request();
        request.volume_path = String::new();
        let result = service.node_expand_volume(Request::new(request)).await;
        assert_code(result, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_expand_success() {
        let mut mocks = Mocks::new();
        mocks
            .helper
            .expect_get_mpath_device()
            .returning(|_| Ok(MPATH_DEVICE.to_string()));
        mocks
            .node_utils
            .expect_get_sys_devices_from_mpath()
            .withf(|dm_name| dm_name == "dm-2")
            .returning(|_| Ok(vec!["sda".to_string(), "sdb".to_string()]));
        mocks
            .node_utils
            .expect_rescan_physical_devices()
            .withf(|sys_devices| sys_devices == ["sda".to_string(), "sdb".to_string()])
            .times(1)
            .returning(|_| Ok(()));
        mocks
            .node_utils
            .expect_expand_mpath_device()
            .withf(|dm_name| dm_name == "dm-2")
            .times(1)
            .returning(|_| Ok(()));
        mocks
            .mounter
            .expect_get_disk_format()
            .returning(|_| Ok("ext4".to_string()));
        mocks
            .node_utils
            .expect_expand_filesystem()
            .withf(|device, mount_path, fs_type| {
                device == MPATH_DEVICE && mount_path == "/staging/test/path" && fs_type == "ext4"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let (service, _locks) = build_service(mocks);

        service
            .node_expand_volume(Request::new(expand_request()))
            .await
            .expect("expand should succeed");
    }

    #[tokio::test]
    async fn test_expand_fail_resize_map_error() {
        let mut mocks = Mocks::new();
        mocks
            .helper
            .expect_get_mpath_device()
            .returning(|_| Ok(MPATH_DEVICE.to_string()));
        mocks
            .node_utils
            .expect_get_sys_devices_from_mpath()
            .returning(|_| Ok(vec!["sda".to_string()]));
        mocks
            .node_utils
            .expect_rescan_physical_devices()
            .returning(|_| Ok(()));
        mocks
            .node_utils
            .expect_expand_mpath_device()
            .returning(|_| {
                Err(NodeUtilsError::CommandFailed {
                    command: "multipathd resize map dm-2".to_string(),
                    stderr: "fail".to_string(),
                })
            });
        let (service, _locks) = build_service(mocks);

        let result = service
            .node_expand_volume(Request::new(expand_request()))
            .await;
        assert_code(result, Code::Internal);
    }

    #[tokio::test]
    async fn test_get_info_with_both_initiator_types() {
        let mut mocks = Mocks::new();
        mocks
            .node_utils
            .expect_get_topology_labels()
            .returning(|_| {
                let mut segments = HashMap::new();
                segments.insert(
                    "topology.kubernetes.io/zone".to_string(),
                    "testZone".to_string(),
                );
                segments
            });
        mocks.node_utils.expect_is_fc_exists().returning(|| true);
        mocks.node_utils.expect_parse_fc_ports().returning(|| {
            Ok(vec![
                "10000000c9934d9f".to_string(),
                "10000000c9934d9h".to_string(),
            ])
        });
        mocks
            .node_utils
            .expect_is_path_exists()
            .withf(|path| path == ISCSI_FULL_PATH)
            .returning(|_| true);
        mocks
            .node_utils
            .expect_parse_iscsi_initiators()
            .returning(|| Ok("iqn.1994-07.com.redhat:e123456789".to_string()));
        mocks
            .node_utils
            .expect_generate_node_id()
            .withf(|hostname, fc_wwns, iqn| {
                hostname == "test-host"
                    && fc_wwns.len() == 2
                    && iqn == "iqn.1994-07.com.redhat:e123456789"
            })
            .returning(|hostname, fc_wwns, iqn| {
                Ok(format!("{hostname};{};{iqn}", fc_wwns.join(":")))
            });
        let (service, _locks) = build_service(mocks);

        let response = service
            .node_get_info(Request::new(csi::NodeGetInfoRequest {}))
            .await
            .expect("node get info should succeed")
            .into_inner();
        assert_eq!(
            response.node_id,
            "test-host;10000000c9934d9f:10000000c9934d9h;iqn.1994-07.com.redhat:e123456789"
        );
        assert_eq!(
            response
                .accessible_topology
                .unwrap()
                .segments
                .get("topology.kubernetes.io/zone"),
            Some(&"testZone".to_string())
        );
    }

    #[tokio::test]
    async fn test_get_info_fail_no_initiators_at_all() {
        let mut mocks = Mocks::new();
        mocks
            .node_utils
            .expect_get_topology_labels()
            .returning(|_| HashMap::new());
        mocks.node_utils.expect_is_fc_exists().returning(|| false);
        mocks
            .node_utils
            .expect_is_path_exists()
            .returning(|_| false);
        let (service, _locks) = build_service(mocks);

        let result = service
            .node_get_info(Request::new(csi::NodeGetInfoRequest {}))
            .await;
        assert_code(result, Code::Internal);
    }

    #[tokio::test]
    async fn test_get_info_fail_fc_parse_error() {
        let mut mocks = Mocks::new();
        mocks
            .node_utils
            .expect_get_topology_labels()
            .returning(|_| HashMap::new());
        mocks.node_utils.expect_is_fc_exists().returning(|| true);
        mocks
            .node_utils
            .expect_parse_fc_ports()
            .returning(|| Err(NodeUtilsError::NoFcPorts("/sys/class/fc_host".to_string())));
        let (service, _locks) = build_service(mocks);

        let result = service
            .node_get_info(Request::new(csi::NodeGetInfoRequest {}))
            .await;
        assert_code(result, Code::Internal);
    }

    #[tokio::test]
    async fn test_get_capabilities() {
        let (service, _locks) = build_service(Mocks::new());

        let response = service
            .node_get_capabilities(Request::new(csi::NodeGetCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner();

        let reported: Vec<i32> = response
            .capabilities
            .iter()
            .filter_map(|capability| match &capability.r#type {
                Some(csi::node_service_capability::Type::Rpc(rpc)) => Some(rpc.r#type),
                None => None,
            })
            .collect();
        assert_eq!(
            reported,
            vec![
                csi::node_service_capability::rpc::Type::StageUnstageVolume as i32,
                csi::node_service_capability::rpc::Type::ExpandVolume as i32,
            ]
        );
    }

    #[tokio::test]
    async fn test_get_volume_stats_unimplemented() {
        let (service, _locks) = build_service(Mocks::new());

        let result = service
            .node_get_volume_stats(Request::new(csi::NodeGetVolumeStatsRequest::default()))
            .await;
        assert_code(result, Code::Unimplemented);
    }

    #[tokio::test]
    async fn test_concurrent_rpc_for_same_volume_is_aborted() {
        let (service, locks) = build_service(Mocks::new());
        assert!(locks.add_volume_lock(VOL_ID));

        let result = service
            .node_unstage_volume(Request::new(csi::NodeUnstageVolumeRequest {
                volume_id: VOL_ID.to_string(),
                staging_target_path: STAGING_PATH.to_string(),
            }))
            .await;
        assert_code(result, Code::Aborted);
        locks.remove_volume_lock(VOL_ID);
    }

    #[tokio::test]
    async fn test_lock_released_after_failed_rpc() {
        let mut mocks = Mocks::new();
        mocks
            .node_utils
            .expect_get_pod_path()
            .returning(|path| format!("/host{path}"));
        mocks
            .node_utils
            .expect_is_not_mount_point()
            .returning(|_| Ok(true));
        mocks
            .helper
            .expect_get_mpath_device()
            .returning(|_| Err(DeviceConnectivityError::Io(std::io::Error::other("boom"))));
        let (service, locks) = build_service(mocks);

        let result = service
            .node_unstage_volume(Request::new(csi::NodeUnstageVolumeRequest {
                volume_id: VOL_ID.to_string(),
                staging_target_path: STAGING_PATH.to_string(),
            }))
            .await;
        assert_code(result, Code::Internal);
        // The guard must have released the lock on the error path.
        assert!(locks.add_volume_lock(VOL_ID));
    }
}
