//! Deployment configuration.
//!
//! A [`Config`] declares providers, workers, bridges and workgroups. The
//! workgroup manager slices it into one [`NodeConfig`] per workgroup, which is
//! what a child process receives (see [`transport`]).

pub mod transport;

use std::collections::HashSet;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dependency::ProviderRef;
use crate::error::{ConfigError, DependencyError};

/// Default provider name when none is given.
pub const DEFAULT_PROVIDER_NAME: &str = "default";

fn empty_options() -> Value {
    Value::Object(Map::new())
}

fn default_instances() -> u32 {
    1
}

fn parse_value<T: DeserializeOwned>(value: &Value) -> Result<T, serde_json::Error> {
    if value.is_null() {
        serde_json::from_value(empty_options())
    } else {
        serde_json::from_value(value.clone())
    }
}

/// Request for a provider instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRequest {
    /// Kind tag of the provider (e.g. `kue`, `logger`, `checkpointer`).
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

impl DependencyRequest {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            name: None,
            optional: false,
        }
    }

    pub fn named(provider: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(provider)
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Singleton key: `<provider>:<name or "default">`.
    pub fn instance_id(&self) -> String {
        instance_id(&self.provider, self.name.as_deref())
    }
}

/// Build the `<provides>:<name>` identifier of a provider instance.
pub fn instance_id(provides: &str, name: Option<&str>) -> String {
    format!("{}:{}", provides, name.unwrap_or(DEFAULT_PROVIDER_NAME))
}

/// A named, typed provider registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub provides: String,
    pub require: ProviderRef,
    #[serde(default = "empty_options")]
    pub options: Value,
}

impl ProviderConfig {
    pub fn new(provides: impl Into<String>, require: ProviderRef) -> Self {
        Self {
            name: None,
            provides: provides.into(),
            require,
            options: empty_options(),
        }
    }

    /// Provider backed by a catalog module.
    pub fn module(provides: impl Into<String>, module: impl Into<String>) -> Self {
        Self::new(provides, ProviderRef::module(module))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    pub fn name_or_default(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_PROVIDER_NAME)
    }

    pub fn instance_id(&self) -> String {
        instance_id(&self.provides, Some(self.name_or_default()))
    }

    /// Deserialize the `options` block; a missing block parses as `{}`.
    pub fn parse_options<T: DeserializeOwned>(&self) -> Result<T, DependencyError> {
        parse_value(&self.options).map_err(|e| DependencyError::InvalidProvider {
            id: self.instance_id(),
            reason: format!("invalid options: {}", e),
        })
    }

    /// Shape checks for a provider entry.
    pub fn validate(&self) -> Result<(), String> {
        if self.provides.trim().is_empty() {
            return Err("\"provides\" is required".to_string());
        }
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err("\"name\" must not be empty".to_string());
            }
        }
        if let ProviderRef::Module(path) = &self.require {
            if path.trim().is_empty() {
                return Err("\"require\" must not be empty".to_string());
            }
        }
        if !(self.options.is_object() || self.options.is_null()) {
            return Err("\"options\" must be an object".to_string());
        }
        Ok(())
    }
}

/// A job-queue consumer declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    pub require: String,
    #[serde(default = "empty_options")]
    pub options: Value,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>, require: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            require: require.into(),
            options: empty_options(),
        }
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }
}

/// A message relay between two `scheme:channel` endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub name: String,
    pub input: String,
    pub output: String,
    #[serde(default = "empty_options")]
    pub options: Value,
}

impl BridgeConfig {
    pub fn new(
        name: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            output: output.into(),
            options: empty_options(),
        }
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    /// Deserialize one section of `options` (e.g. `kue` or `imq`);
    /// a missing section parses as `{}`.
    pub fn section<T: DeserializeOwned>(&self, key: &str) -> Result<T, serde_json::Error> {
        parse_value(self.options.get(key).unwrap_or(&Value::Null))
    }
}

/// A deployable bundle of worker and bridge names.
///
/// Keys other than `name`, `workers` and `instances` are process-manager
/// overrides merged into the launch descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkgroupConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub workers: Vec<String>,
    #[serde(default = "default_instances")]
    pub instances: u32,
    #[serde(flatten)]
    pub overrides: Map<String, Value>,
}

impl WorkgroupConfig {
    pub fn new(workers: Vec<String>) -> Self {
        Self {
            name: None,
            workers,
            instances: default_instances(),
            overrides: Map::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_instances(mut self, instances: u32) -> Self {
        self.instances = instances;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.workers.is_empty() {
            return Err("\"workers\" must list at least one worker".to_string());
        }
        if self.instances < 1 {
            return Err("\"instances\" must be >= 1".to_string());
        }
        Ok(())
    }
}

/// Full deployment configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
    #[serde(default)]
    pub bridges: Vec<BridgeConfig>,
    #[serde(default)]
    pub workgroups: Vec<WorkgroupConfig>,
}

impl Config {
    /// Load a JSON or YAML configuration file, chosen by extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        match extension.as_str() {
            "json" => Ok(serde_json::from_str(&content)?),
            "yaml" | "yml" => Ok(serde_yaml::from_str(&content)?),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Shape checks performed before launch.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for provider in &self.providers {
            provider.validate().map_err(|reason| {
                ConfigError::Invalid(format!("provider {}: {}", provider.instance_id(), reason))
            })?;
        }

        let mut names = HashSet::new();
        for worker in &self.workers {
            if worker.name.trim().is_empty() || worker.require.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "workers need a \"name\" and a \"require\"".to_string(),
                ));
            }
            if !names.insert(worker.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate worker or bridge name: {}",
                    worker.name
                )));
            }
        }

        for bridge in &self.bridges {
            if !names.insert(bridge.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate worker or bridge name: {}",
                    bridge.name
                )));
            }
            for endpoint in [&bridge.input, &bridge.output] {
                if endpoint.find(':').map_or(true, |i| i == 0) {
                    return Err(ConfigError::Invalid(format!(
                        "bridge {}: endpoint '{}' must be of the form scheme:channel",
                        bridge.name, endpoint
                    )));
                }
            }
        }

        for workgroup in &self.workgroups {
            workgroup.validate().map_err(|reason| {
                ConfigError::Invalid(format!(
                    "workgroup {}: {}",
                    workgroup.name.as_deref().unwrap_or("<unnamed>"),
                    reason
                ))
            })?;
        }

        Ok(())
    }

    /// Slice out the configuration for a single workgroup.
    pub fn node_config(&self, workgroup: &WorkgroupConfig) -> NodeConfig {
        NodeConfig {
            providers: self.providers.clone(),
            workers: self.workers.clone(),
            bridges: self.bridges.clone(),
            workgroup: workgroup.clone(),
        }
    }

    /// Slice out the configuration for the workgroup with the given name.
    pub fn node_config_for(&self, name: &str) -> Result<NodeConfig, ConfigError> {
        self.workgroups
            .iter()
            .find(|w| w.name.as_deref() == Some(name))
            .map(|w| self.node_config(w))
            .ok_or_else(|| ConfigError::WorkgroupNotFound(name.to_string()))
    }
}

/// Configuration of one workgroup instance, as shipped to a child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
    #[serde(default)]
    pub bridges: Vec<BridgeConfig>,
    pub workgroup: WorkgroupConfig,
}

impl NodeConfig {
    pub fn encode(&self) -> Result<String, ConfigError> {
        transport::encode(self)
    }

    pub fn decode(encoded: &str) -> Result<Self, ConfigError> {
        transport::decode(encoded)
    }

    pub fn find_worker(&self, name: &str) -> Option<&WorkerConfig> {
        self.workers.iter().find(|w| w.name == name)
    }

    pub fn find_bridge(&self, name: &str) -> Option<&BridgeConfig> {
        self.bridges.iter().find(|b| b.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn sample_config() -> Config {
        serde_json::from_value(json!({
            "providers": [
                { "provides": "kue", "require": "kued/providers/memory-queue" }
            ],
            "workers": [
                { "name": "Dumper", "require": "kued/workers/dumper" }
            ],
            "bridges": [
                { "name": "OrdersBridge", "input": "imq:orders", "output": "kue:orders" }
            ],
            "workgroups": [
                { "name": "ingest", "workers": ["Dumper", "OrdersBridge"], "restart_delay": 500 }
            ]
        }))
        .expect("sample config parses")
    }

    #[test]
    fn test_defaults_applied() {
        let config = sample_config();
        let workgroup = &config.workgroups[0];

        assert_eq!(workgroup.instances, 1);
        assert_eq!(workgroup.overrides.get("restart_delay"), Some(&json!(500)));
        assert_eq!(config.providers[0].name_or_default(), "default");
        assert_eq!(config.providers[0].instance_id(), "kue:default");
        assert_eq!(config.workers[0].options, json!({}));
    }

    #[test]
    fn test_instance_id() {
        assert_eq!(instance_id("abc", Some("123")), "abc:123");
        assert_eq!(instance_id("abc", None), "abc:default");
        assert_eq!(DependencyRequest::new("kue").instance_id(), "kue:default");
        assert_eq!(
            DependencyRequest::named("imq", "eu-west-2").instance_id(),
            "imq:eu-west-2"
        );
    }

    #[test]
    fn test_validate_accepts_sample() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let mut config = sample_config();
        config.bridges[0].name = "Dumper".to_string();

        let err = config.validate().expect_err("duplicate names");
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_validate_rejects_bad_endpoint() {
        let mut config = sample_config();
        config.bridges[0].input = "orders".to_string();
        assert!(config.validate().is_err());

        config.bridges[0].input = ":orders".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_workgroup() {
        let mut config = sample_config();
        config.workgroups[0].workers.clear();
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.workgroups[0].instances = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_node_config_round_trip_through_transport() {
        let config = sample_config();
        let node = config.node_config_for("ingest").expect("workgroup exists");

        let decoded = NodeConfig::decode(&node.encode().expect("encode")).expect("decode");
        assert_eq!(decoded.workgroup, node.workgroup);
        assert_eq!(decoded.workers, node.workers);
        assert!(decoded.find_bridge("OrdersBridge").is_some());
        assert!(decoded.find_worker("OrdersBridge").is_none());
    }

    #[test]
    fn test_node_config_for_missing_workgroup() {
        let err = sample_config()
            .node_config_for("nope")
            .expect_err("missing workgroup");
        assert!(matches!(err, ConfigError::WorkgroupNotFound(name) if name == "nope"));
    }

    #[test]
    fn test_bridge_section_defaults_to_empty() {
        #[derive(Deserialize, Default)]
        struct Section {
            #[serde(default)]
            concurrency: Option<usize>,
        }

        let bridge = BridgeConfig::new("b", "kue:a", "kue:b");
        let section: Section = bridge.section("kue").expect("empty section parses");
        assert_eq!(section.concurrency, None);

        let bridge = bridge.with_options(json!({ "kue": { "concurrency": 4 } }));
        let section: Section = bridge.section("kue").expect("section parses");
        assert_eq!(section.concurrency, Some(4));
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("temp file");
        writeln!(
            file,
            "providers:\n  - provides: kue\n    require: kued/providers/memory-queue\nworkers:\n  - name: Dumper\n    require: kued/workers/dumper\nworkgroups:\n  - name: main\n    workers: [Dumper]\n    instances: 2\n"
        )
        .expect("write");

        let config = Config::load(file.path()).expect("yaml loads");
        assert_eq!(config.workgroups[0].instances, 2);
        assert_eq!(config.workers[0].name, "Dumper");
    }

    #[test]
    fn test_load_rejects_unknown_extension() {
        let file = tempfile::Builder::new()
            .suffix(".ini")
            .tempfile()
            .expect("temp file");
        let err = Config::load(file.path()).expect_err("unsupported");
        assert!(matches!(err, ConfigError::UnsupportedFormat(ext) if ext == "ini"));
    }
}
