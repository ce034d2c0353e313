//! Driver configuration loaded from YAML.
//!
//! The controller plane and the node agree on the publish-context parameter
//! names through this file; deployments can also pin topology segments here.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigYaml {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub node: NodeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_driver_name")]
    pub name: String,
    #[serde(default = "default_driver_version")]
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Publish-context key carrying the LUN index as a decimal string.
    #[serde(default = "default_lun_parameter")]
    pub publish_context_lun_parameter: String,
    /// Publish-context key carrying `iscsi` or `fc`.
    #[serde(default = "default_connectivity_parameter")]
    pub publish_context_connectivity_parameter: String,
    /// Publish-context key carrying the comma-separated array IQN list.
    #[serde(default = "default_array_iqn_parameter")]
    pub publish_context_array_iqn_parameter: String,
    /// Publish-context key carrying the comma-separated array WWPN list.
    #[serde(default = "default_fc_initiators_parameter")]
    pub publish_context_fc_initiators_parameter: String,
    /// Topology segments reported by NodeGetInfo for this node.
    #[serde(default)]
    pub topology_segments: HashMap<String, String>,
}

fn default_driver_name() -> String {
    "sanblock.csi.io".to_string()
}

fn default_driver_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_lun_parameter() -> String {
    "PUBLISH_CONTEXT_LUN".to_string()
}

fn default_connectivity_parameter() -> String {
    "PUBLISH_CONTEXT_CONNECTIVITY".to_string()
}

fn default_array_iqn_parameter() -> String {
    "PUBLISH_CONTEXT_ARRAY_IQN".to_string()
}

fn default_fc_initiators_parameter() -> String {
    "PUBLISH_CONTEXT_FC_INITIATORS".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: default_driver_name(),
            version: default_driver_version(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            publish_context_lun_parameter: default_lun_parameter(),
            publish_context_connectivity_parameter: default_connectivity_parameter(),
            publish_context_array_iqn_parameter: default_array_iqn_parameter(),
            publish_context_fc_initiators_parameter: default_fc_initiators_parameter(),
            topology_segments: HashMap::new(),
        }
    }
}

impl ConfigYaml {
    /// Load the config from a YAML file; missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConfigYaml::default();
        assert_eq!(config.identity.name, "sanblock.csi.io");
        assert_eq!(config.node.publish_context_lun_parameter, "PUBLISH_CONTEXT_LUN");
        assert_eq!(
            config.node.publish_context_connectivity_parameter,
            "PUBLISH_CONTEXT_CONNECTIVITY"
        );
        assert_eq!(
            config.node.publish_context_array_iqn_parameter,
            "PUBLISH_CONTEXT_ARRAY_IQN"
        );
        assert!(config.node.topology_segments.is_empty());
    }

    #[test]
    fn test_parse_partial_yaml_uses_defaults() {
        let yaml = r#"
identity:
  name: block.csi.example.com
node:
  topology_segments:
    topology.kubernetes.io/zone: testZone
"#;
        let config: ConfigYaml = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.identity.name, "block.csi.example.com");
        assert_eq!(config.node.publish_context_lun_parameter, "PUBLISH_CONTEXT_LUN");
        assert_eq!(
            config.node.topology_segments.get("topology.kubernetes.io/zone"),
            Some(&"testZone".to_string())
        );
    }
}
