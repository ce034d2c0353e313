use std::collections::BTreeSet;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceConnectivityError {
    /// Consistency violation: the same volume resolved to more than one
    /// device-mapper device on this node.
    #[error("volume '{volume_id}' maps to multiple multipath devices: {devices:?}")]
    MultipleDmDevices {
        volume_id: String,
        devices: BTreeSet<String>,
    },

    /// The volume has no multipath device on this node. Recoverable during
    /// unstage, where it means the device is already gone.
    #[error("multipath device was not found for volume '{volume_id}'")]
    MultipathDeviceNotFoundForVolume { volume_id: String },

    /// A by-path link resolved to an sd device that has no dm parent.
    #[error("multipath device was not found for path '{by_path}' (link target '{link_target}')")]
    MultipleDeviceNotFound {
        by_path: String,
        link_target: String,
    },

    #[error("no iscsi session matched storage target '{target_name}' under '{directory}'")]
    IscsiStorageTargetNotFound {
        target_name: String,
        directory: String,
    },

    #[error("no online fc host found under '{directory}'")]
    FcHostTargetNotFound { directory: String },

    #[error("unsupported connectivity type '{0}'")]
    UnsupportedConnectivityType(String),

    #[error("nothing was written to scan file '{0}'")]
    NothingWasWrittenToScanFile(String),

    #[error("command '{command}' failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DeviceConnectivityError>;
