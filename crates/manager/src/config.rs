//! Coordinator and resource configuration.

use std::time::Duration;

use common::ProcessHandle;
use serde::{Deserialize, Serialize};

use crate::{ManagerError, Result};

/// How messages are handed to a resource instance or a waiting caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchPolicy {
    /// Wait until the receiving queue has room.
    Blocking,
    /// Try once; a request that cannot be delivered is queued as pending,
    /// a reply that cannot be delivered is dropped.
    #[default]
    NonBlocking,
}

impl std::str::FromStr for DispatchPolicy {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "blocking" => Ok(DispatchPolicy::Blocking),
            "non-blocking" | "nonblocking" => Ok(DispatchPolicy::NonBlocking),
            other => Err(ManagerError::Config(format!(
                "unknown dispatch policy '{other}'"
            ))),
        }
    }
}

fn default_instances() -> usize {
    1
}

/// One configured resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Key of the XA switch that drives it.
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub openinfo: String,
    #[serde(default)]
    pub closeinfo: String,
    /// Number of proxy instances, each with its own connection.
    #[serde(default = "default_instances")]
    pub instances: usize,
}

impl ResourceConfig {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            openinfo: String::new(),
            closeinfo: String::new(),
            instances: default_instances(),
        }
    }

    pub fn with_instances(mut self, instances: usize) -> Self {
        self.instances = instances;
        self
    }

    pub fn with_openinfo(mut self, info: impl Into<String>) -> Self {
        self.openinfo = info.into();
        self
    }
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Handle the coordinator reports as in connect replies.
    pub process: ProcessHandle,
    pub dispatch: DispatchPolicy,
    /// Capacity of the coordinator's inbound queue.
    pub queue_capacity: usize,
    /// Interval between timeout sweeps.
    pub timeout_scan: Duration,
    pub resources: Vec<ResourceConfig>,
}

impl ManagerConfig {
    pub fn with_resources(mut self, resources: Vec<ResourceConfig>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchPolicy) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_timeout_scan(mut self, interval: Duration) -> Self {
        self.timeout_scan = interval;
        self
    }

    /// Rejects settings the coordinator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(ManagerError::Config("queue capacity must be positive".into()));
        }
        if self.timeout_scan.is_zero() {
            return Err(ManagerError::Config("timeout scan interval must be positive".into()));
        }
        if let Some(resource) = self.resources.iter().find(|r| r.instances == 0) {
            return Err(ManagerError::Config(format!(
                "resource '{}' has no instances",
                resource.name
            )));
        }
        Ok(())
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            process: ProcessHandle::current(),
            dispatch: DispatchPolicy::default(),
            queue_capacity: 1024,
            timeout_scan: Duration::from_secs(1),
            resources: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_policy_parses() {
        assert_eq!(
            "blocking".parse::<DispatchPolicy>().unwrap(),
            DispatchPolicy::Blocking
        );
        assert_eq!(
            "Non-Blocking".parse::<DispatchPolicy>().unwrap(),
            DispatchPolicy::NonBlocking
        );
        assert!("eventually".parse::<DispatchPolicy>().is_err());
    }

    #[test]
    fn resource_config_defaults_to_one_instance() {
        let config: ResourceConfig =
            serde_json::from_str(r#"{"key":"memory","name":"orders"}"#).unwrap();
        assert_eq!(config.instances, 1);
        assert!(config.openinfo.is_empty());
    }

    #[test]
    fn validate_rejects_resources_without_instances() {
        let config = ManagerConfig::default()
            .with_resources(vec![ResourceConfig::new("memory", "orders").with_instances(0)]);
        assert!(matches!(config.validate(), Err(ManagerError::Config(_))));
    }

    #[test]
    fn default_config_is_valid() {
        assert!(ManagerConfig::default().validate().is_ok());
    }
}
