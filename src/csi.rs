//! CSI v1 message types for the node service surface.
//!
//! Checked-in prost definitions matching the Container Storage Interface
//! `csi.proto` (v1), restricted to the messages the node service exchanges.
//! Field numbers and enum values track the upstream proto so the types stay
//! wire-compatible with any CSI v1 transport.

/// Specifies a capability of a volume.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VolumeCapability {
    /// Specifies what API the volume will be accessed using. One of the
    /// following fields MUST be specified.
    #[prost(oneof = "volume_capability::AccessType", tags = "1, 2")]
    pub access_type: ::core::option::Option<volume_capability::AccessType>,
    /// This is a REQUIRED field.
    #[prost(message, optional, tag = "3")]
    pub access_mode: ::core::option::Option<volume_capability::AccessMode>,
}
/// Nested message and enum types in `VolumeCapability`.
pub mod volume_capability {
    /// Indicate that the volume will be accessed via the block device API.
    ///
    /// Intentionally empty, for now.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BlockVolume {}
    /// Indicate that the volume will be accessed via the filesystem API.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MountVolume {
        /// The filesystem type. An empty string is equal to an unspecified
        /// field value. This field is OPTIONAL.
        #[prost(string, tag = "1")]
        pub fs_type: ::prost::alloc::string::String,
        /// The mount options that can be used for the volume. This field is
        /// OPTIONAL.
        #[prost(string, repeated, tag = "2")]
        pub mount_flags: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    }
    /// Specify how a volume can be accessed.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AccessMode {
        /// This field is REQUIRED.
        #[prost(enumeration = "access_mode::Mode", tag = "1")]
        pub mode: i32,
    }
    /// Nested message and enum types in `AccessMode`.
    pub mod access_mode {
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
        )]
        #[repr(i32)]
        pub enum Mode {
            Unknown = 0,
            /// Can only be published once as read/write on a single node, at
            /// any given time.
            SingleNodeWriter = 1,
            /// Can only be published once as readonly on a single node, at
            /// any given time.
            SingleNodeReaderOnly = 2,
            /// Can be published as readonly at multiple nodes simultaneously.
            MultiNodeReaderOnly = 3,
            /// Can be published at multiple nodes simultaneously. Only one of
            /// the node can be used as read/write. The rest will be readonly.
            MultiNodeSingleWriter = 4,
            /// Can be published as read/write at multiple nodes
            /// simultaneously.
            MultiNodeMultiWriter = 5,
        }
    }
    /// Specifies what API the volume will be accessed using.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum AccessType {
        #[prost(message, tag = "1")]
        Block(BlockVolume),
        #[prost(message, tag = "2")]
        Mount(MountVolume),
    }
}
/// The capacity of the storage space in bytes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CapacityRange {
    /// Volume MUST be at least this big. This field is OPTIONAL.
    #[prost(int64, tag = "1")]
    pub required_bytes: i64,
    /// Volume MUST not be bigger than this. This field is OPTIONAL.
    #[prost(int64, tag = "2")]
    pub limit_bytes: i64,
}
/// Topology is a map of topological domains to topological segments.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Topology {
    #[prost(map = "string, string", tag = "1")]
    pub segments: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeStageVolumeRequest {
    /// The ID of the volume to publish. This field is REQUIRED.
    #[prost(string, tag = "1")]
    pub volume_id: ::prost::alloc::string::String,
    /// The CO SHALL set this field to the value returned by
    /// `ControllerPublishVolume` if the corresponding Controller Plugin
    /// has `PUBLISH_UNPUBLISH_VOLUME` controller capability. This field is
    /// OPTIONAL and MUST match the fields set in the response.
    #[prost(map = "string, string", tag = "2")]
    pub publish_context: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
    /// The path to which the volume MAY be staged. This field is REQUIRED.
    #[prost(string, tag = "3")]
    pub staging_target_path: ::prost::alloc::string::String,
    /// Volume capability describing how the CO intends to use this volume.
    /// This field is REQUIRED.
    #[prost(message, optional, tag = "4")]
    pub volume_capability: ::core::option::Option<VolumeCapability>,
    /// Secrets required by plugin to complete node stage volume request.
    /// This field is OPTIONAL.
    #[prost(map = "string, string", tag = "5")]
    pub secrets: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
    /// Volume context as returned by CO in CreateVolumeRequest. This field
    /// is OPTIONAL.
    #[prost(map = "string, string", tag = "6")]
    pub volume_context: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
}
/// Intentionally empty.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeStageVolumeResponse {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeUnstageVolumeRequest {
    /// The ID of the volume. This field is REQUIRED.
    #[prost(string, tag = "1")]
    pub volume_id: ::prost::alloc::string::String,
    /// The path at which the volume was staged. This field is REQUIRED.
    #[prost(string, tag = "2")]
    pub staging_target_path: ::prost::alloc::string::String,
}
/// Intentionally empty.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeUnstageVolumeResponse {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodePublishVolumeRequest {
    /// The ID of the volume to publish. This field is REQUIRED.
    #[prost(string, tag = "1")]
    pub volume_id: ::prost::alloc::string::String,
    /// The CO SHALL set this field to the value returned by
    /// `ControllerPublishVolume`. This field is OPTIONAL.
    #[prost(map = "string, string", tag = "2")]
    pub publish_context: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
    /// The path to which the volume was staged by `NodeStageVolume`. This
    /// field is REQUIRED if the Node Plugin has `STAGE_UNSTAGE_VOLUME`
    /// capability.
    #[prost(string, tag = "3")]
    pub staging_target_path: ::prost::alloc::string::String,
    /// The path to which the volume will be published. This field is
    /// REQUIRED.
    #[prost(string, tag = "4")]
    pub target_path: ::prost::alloc::string::String,
    /// Volume capability describing how the CO intends to use this volume.
    /// This field is REQUIRED.
    #[prost(message, optional, tag = "5")]
    pub volume_capability: ::core::option::Option<VolumeCapability>,
    /// Indicates SP MUST publish the volume in readonly mode. This field is
    /// REQUIRED.
    #[prost(bool, tag = "6")]
    pub readonly: bool,
    /// Secrets required by plugin to complete node publish volume request.
    /// This field is OPTIONAL.
    #[prost(map = "string, string", tag = "7")]
    pub secrets: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
    /// Volume context as returned by CO in CreateVolumeRequest. This field
    /// is OPTIONAL.
    #[prost(map = "string, string", tag = "8")]
    pub volume_context: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
}
/// Intentionally empty.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodePublishVolumeResponse {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeUnpublishVolumeRequest {
    /// The ID of the volume. This field is REQUIRED.
    #[prost(string, tag = "1")]
    pub volume_id: ::prost::alloc::string::String,
    /// The path at which the volume was published. This field is REQUIRED.
    #[prost(string, tag = "2")]
    pub target_path: ::prost::alloc::string::String,
}
/// Intentionally empty.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeUnpublishVolumeResponse {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeGetVolumeStatsRequest {
    /// The ID of the volume. This field is REQUIRED.
    #[prost(string, tag = "1")]
    pub volume_id: ::prost::alloc::string::String,
    /// It can be any valid path where volume was previously staged or
    /// published. This field is REQUIRED.
    #[prost(string, tag = "2")]
    pub volume_path: ::prost::alloc::string::String,
    /// The path where the volume is staged. This field is OPTIONAL.
    #[prost(string, tag = "3")]
    pub staging_target_path: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeGetVolumeStatsResponse {
    /// This field is OPTIONAL.
    #[prost(message, repeated, tag = "1")]
    pub usage: ::prost::alloc::vec::Vec<VolumeUsage>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VolumeUsage {
    /// The available capacity in specified Unit. This field is OPTIONAL.
    #[prost(int64, tag = "1")]
    pub available: i64,
    /// The total capacity in specified Unit. This field is REQUIRED.
    #[prost(int64, tag = "2")]
    pub total: i64,
    /// The used capacity in specified Unit. This field is OPTIONAL.
    #[prost(int64, tag = "3")]
    pub used: i64,
    /// Units by which values are measured. This field is REQUIRED.
    #[prost(enumeration = "volume_usage::Unit", tag = "4")]
    pub unit: i32,
}
/// Nested message and enum types in `VolumeUsage`.
pub mod volume_usage {
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum Unit {
        Unknown = 0,
        Bytes = 1,
        Inodes = 2,
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeExpandVolumeRequest {
    /// The ID of the volume. This field is REQUIRED.
    #[prost(string, tag = "1")]
    pub volume_id: ::prost::alloc::string::String,
    /// The path on which volume is available. This field is REQUIRED.
    #[prost(string, tag = "2")]
    pub volume_path: ::prost::alloc::string::String,
    /// This allows CO to specify the capacity requirements of the volume
    /// after expansion. This field is OPTIONAL.
    #[prost(message, optional, tag = "3")]
    pub capacity_range: ::core::option::Option<CapacityRange>,
    /// The path where the volume is staged. This field is OPTIONAL.
    #[prost(string, tag = "4")]
    pub staging_target_path: ::prost::alloc::string::String,
    /// Volume capability describing how the CO intends to use this volume.
    /// This field is OPTIONAL.
    #[prost(message, optional, tag = "5")]
    pub volume_capability: ::core::option::Option<VolumeCapability>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeExpandVolumeResponse {
    /// The capacity of the volume in bytes. This field is OPTIONAL.
    #[prost(int64, tag = "1")]
    pub capacity_bytes: i64,
}
/// Intentionally empty.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeGetCapabilitiesRequest {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeGetCapabilitiesResponse {
    /// All the capabilities that the node service supports. This field is
    /// OPTIONAL.
    #[prost(message, repeated, tag = "1")]
    pub capabilities: ::prost::alloc::vec::Vec<NodeServiceCapability>,
}
/// Specifies a capability of the node service.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeServiceCapability {
    #[prost(oneof = "node_service_capability::Type", tags = "1")]
    pub r#type: ::core::option::Option<node_service_capability::Type>,
}
/// Nested message and enum types in `NodeServiceCapability`.
pub mod node_service_capability {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Rpc {
        #[prost(enumeration = "rpc::Type", tag = "1")]
        pub r#type: i32,
    }
    /// Nested message and enum types in `RPC`.
    pub mod rpc {
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
        )]
        #[repr(i32)]
        pub enum Type {
            Unknown = 0,
            StageUnstageVolume = 1,
            /// If Plugin implements GET_VOLUME_STATS capability then it MUST
            /// implement NodeGetVolumeStats RPC call for fetching volume
            /// statistics.
            GetVolumeStats = 2,
            /// See VolumeExpansion for details.
            ExpandVolume = 3,
        }
    }
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        /// RPC that the controller supports.
        #[prost(message, tag = "1")]
        Rpc(Rpc),
    }
}
/// Intentionally empty.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeGetInfoRequest {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeGetInfoResponse {
    /// The identifier of the node as understood by the SP. This field is
    /// REQUIRED. This field MUST contain enough information to uniquely
    /// identify this specific node vs all other nodes supported by this
    /// plugin. The SP is NOT responsible for global uniqueness of node_id
    /// across multiple SPs. This field overrides the general CSI size limit.
    /// The size of this field SHALL NOT exceed 256 bytes. The general CSI
    /// size limit, 128 bytes, is RECOMMENDED for best backwards
    /// compatibility.
    #[prost(string, tag = "1")]
    pub node_id: ::prost::alloc::string::String,
    /// Maximum number of volumes that controller can publish to the node.
    /// If value is not set or zero CO SHALL decide how many volumes of this
    /// type can be published by the controller to the node. This field is
    /// OPTIONAL.
    #[prost(int64, tag = "2")]
    pub max_volumes_per_node: i64,
    /// Specifies where (regions, zones, racks, etc.) the node is accessible
    /// from. This field is OPTIONAL.
    #[prost(message, optional, tag = "3")]
    pub accessible_topology: ::core::option::Option<Topology>,
}
