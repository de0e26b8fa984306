use std::collections::HashSet;
use std::time::Duration;

use dtn_wire::eid::{is_hostname, validate_scheme, DTN_SCHEME};
use serde::Deserialize;

use crate::error::AgentError;

pub const CONFIG_VERSION: u32 = 1;

pub const DEFAULT_STORAGE_CAPACITY: usize = 1024;
pub const DEFAULT_ABSENCE_TIMEOUT_MS: u64 = 20_000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfigInput {
    pub version: u32,
    pub hostname: Option<String>,
    pub time_scale: Option<f64>,
    pub absence_timeout_ms: Option<u64>,
    pub storage: StorageConfigInput,
    pub convergence_layers: Vec<ConvergenceLayerConfigInput>,
    pub routers: Vec<RouterConfigInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfigInput {
    pub model: Option<String>,
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConvergenceLayerConfigInput {
    pub kind: String,
    pub adapters: Vec<AdapterConfigInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdapterConfigInput {
    pub name: String,
    pub discovery: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouterConfigInput {
    pub kind: String,
    pub registration: String,
    pub properties: toml::Table,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_STORAGE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    pub name: String,
    pub discovery: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceLayerConfig {
    pub kind: String,
    pub adapters: Vec<AdapterConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouterConfig {
    pub kind: String,
    pub registration: String,
    pub properties: toml::Table,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub version: u32,
    pub hostname: String,
    pub time_scale: f64,
    pub absence_timeout: Duration,
    pub storage: StorageConfig,
    pub convergence_layers: Vec<ConvergenceLayerConfig>,
    pub routers: Vec<RouterConfig>,
}

impl AgentConfig {
    /// Minimal configuration: one virtual adapter with discovery, no routers.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            version: CONFIG_VERSION,
            hostname: hostname.into(),
            time_scale: 1.0,
            absence_timeout: Duration::from_millis(DEFAULT_ABSENCE_TIMEOUT_MS),
            storage: StorageConfig::default(),
            convergence_layers: vec![ConvergenceLayerConfig {
                kind: "virtual".into(),
                adapters: vec![AdapterConfig {
                    name: "vnet".into(),
                    discovery: true,
                }],
            }],
            routers: Vec::new(),
        }
    }

    pub fn with_router(mut self, kind: &str, registration: &str) -> Self {
        self.routers.push(RouterConfig {
            kind: kind.into(),
            registration: registration.into(),
            properties: toml::Table::new(),
        });
        self
    }

    pub fn from_toml_str(input: &str) -> Result<Self, AgentError> {
        let parsed: AgentConfigInput = toml::from_str(input)
            .map_err(|e| AgentError::config(format!("invalid config TOML: {e}")))?;
        parsed.resolve()
    }
}

impl AgentConfigInput {
    pub fn resolve(self) -> Result<AgentConfig, AgentError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(AgentError::config(format!("unsupported config version {version}")));
        }

        let hostname = self
            .hostname
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| AgentError::config("hostname is required"))?;
        if !is_hostname(&hostname) {
            return Err(AgentError::config(format!(
                "hostname {hostname:?} does not form a valid dtn://hostname"
            )));
        }

        let time_scale = self.time_scale.unwrap_or(1.0);
        if !(time_scale.is_finite() && time_scale > 0.0) {
            return Err(AgentError::config(format!("time_scale must be > 0, got {time_scale}")));
        }

        match self.storage.model.as_deref().map(str::trim) {
            None | Some("memory") => {}
            Some(other) => {
                return Err(AgentError::config(format!("unknown storage model {other:?}")));
            }
        }
        let storage = StorageConfig {
            capacity: self
                .storage
                .capacity
                .unwrap_or(DEFAULT_STORAGE_CAPACITY)
                .max(1),
        };

        let mut adapter_names = HashSet::new();
        let mut convergence_layers = Vec::new();
        for layer in self.convergence_layers {
            let kind = layer.kind.trim().to_ascii_lowercase();
            if kind.is_empty() {
                return Err(AgentError::config("convergence layer without kind"));
            }
            let mut adapters = Vec::new();
            for adapter in layer.adapters {
                let name = adapter.name.trim().to_string();
                if name.is_empty() {
                    return Err(AgentError::config(format!("{kind} adapter without name")));
                }
                if !adapter_names.insert(name.clone()) {
                    return Err(AgentError::config(format!("duplicate adapter name {name:?}")));
                }
                adapters.push(AdapterConfig {
                    name,
                    discovery: adapter.discovery.unwrap_or(true),
                });
            }
            convergence_layers.push(ConvergenceLayerConfig { kind, adapters });
        }

        let mut registrations = HashSet::new();
        let mut routers = Vec::new();
        for router in self.routers {
            let kind = router.kind.trim().to_ascii_lowercase();
            if kind.is_empty() {
                return Err(AgentError::config("router without kind"));
            }
            let registration = router.registration.trim().to_string();
            validate_scheme(&registration).map_err(|e| {
                AgentError::config(format!("router {kind}: bad registration: {e}"))
            })?;
            if registration == DTN_SCHEME {
                return Err(AgentError::config(format!(
                    "router {kind}: registration {DTN_SCHEME:?} is reserved"
                )));
            }
            if !registrations.insert(registration.clone()) {
                return Err(AgentError::config(format!(
                    "duplicate router registration {registration:?}"
                )));
            }
            routers.push(RouterConfig {
                kind,
                registration,
                properties: router.properties,
            });
        }

        Ok(AgentConfig {
            version,
            hostname,
            time_scale,
            absence_timeout: Duration::from_millis(
                self.absence_timeout_ms.unwrap_or(DEFAULT_ABSENCE_TIMEOUT_MS),
            ),
            storage,
            convergence_layers,
            routers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_toml_config_full() {
        let toml = r#"
            hostname = "alpha"
            time_scale = 0.01

            [storage]
            model = "memory"
            capacity = 64

            [[convergence_layers]]
            kind = "virtual"
            [[convergence_layers.adapters]]
            name = "wlan"
            [[convergence_layers.adapters]]
            name = "bt"
            discovery = false

            [[routers]]
            kind = "prophet"
            registration = "prophet"

            [[routers]]
            kind = "DLife"
            registration = "dlife"
            [routers.properties]
            dslen = 12
            dsdur = 600
        "#;

        let cfg = AgentConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.version, CONFIG_VERSION);
        assert_eq!(cfg.hostname, "alpha");
        assert_eq!(cfg.time_scale, 0.01);
        assert_eq!(cfg.storage.capacity, 64);
        assert_eq!(cfg.absence_timeout, Duration::from_secs(20));
        assert_eq!(cfg.convergence_layers.len(), 1);
        let adapters = &cfg.convergence_layers[0].adapters;
        assert_eq!(adapters[0].name, "wlan");
        assert!(adapters[0].discovery);
        assert!(!adapters[1].discovery);
        assert_eq!(cfg.routers[1].kind, "dlife");
        assert_eq!(cfg.routers[1].properties["dslen"].as_integer(), Some(12));
    }

    #[test]
    fn hostname_required() {
        assert!(matches!(
            AgentConfig::from_toml_str(""),
            Err(AgentError::Config(_))
        ));
        assert!(AgentConfig::from_toml_str("hostname = \"Bad Host\"").is_err());
    }

    #[test]
    fn registration_rules() {
        let reserved = r#"
            hostname = "a"
            [[routers]]
            kind = "prophet"
            registration = "dtn"
        "#;
        assert!(AgentConfig::from_toml_str(reserved).is_err());

        let invalid = r#"
            hostname = "a"
            [[routers]]
            kind = "prophet"
            registration = "Pro_phet"
        "#;
        assert!(AgentConfig::from_toml_str(invalid).is_err());

        let duplicate = r#"
            hostname = "a"
            [[routers]]
            kind = "prophet"
            registration = "r1"
            [[routers]]
            kind = "dlife"
            registration = "r1"
        "#;
        assert!(AgentConfig::from_toml_str(duplicate).is_err());
    }

    #[test]
    fn bad_scale_and_storage() {
        assert!(AgentConfig::from_toml_str("hostname = \"a\"\ntime_scale = 0.0").is_err());
        assert!(AgentConfig::from_toml_str("hostname = \"a\"\n[storage]\nmodel = \"sql\"").is_err());
    }

    #[test]
    fn builder_defaults() {
        let cfg = AgentConfig::new("node").with_router("prophet", "prophet");
        assert_eq!(cfg.storage.capacity, DEFAULT_STORAGE_CAPACITY);
        assert_eq!(cfg.convergence_layers[0].adapters[0].name, "vnet");
        assert_eq!(cfg.routers[0].registration, "prophet");
    }
}
