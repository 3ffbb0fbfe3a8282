//! Unit handlers.
//!
//! A handler performs the remote work for one unit type. It reads upstream
//! values from the [`DependencyMap`] and publishes its own before returning,
//! so dependent units always see them.
//!
//! | Type                  | Handler                       |
//! |-----------------------|-------------------------------|
//! | `install-haproxy`     | [`haproxy::HaproxyHandler`]   |
//! | `haproxy`             | [`haproxy::HaproxyHandler`]   |
//! | `install-k3s-server`  | [`cluster::ClusterHandler`]   |
//! | `install-rke2-server` | [`cluster::ClusterHandler`]   |
//! | `k3s`, `rke2`         | [`cluster::ClusterHandler`]   |
//! | `get-kubeconfig`      | [`cluster::KubeconfigHandler`]|
//! | `kubeadm`             | [`kubeadm::KubeadmHandler`]   |
//! | `configure-ipxe-boot` | [`harvester::IpxeBootHandler`]|
//! | `harvester`           | [`harvester::HarvesterHandler`]|

pub mod cluster;
pub mod harvester;
pub mod haproxy;
pub mod kubeadm;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::deps::{DepValue, DependencyMap};
use crate::error::HandlerError;
use crate::executor::WorkUnit;
use crate::providers::VmHandle;
use crate::remote::{RemoteExecutor, RemoteHost};
use crate::scripts::Distribution;

/// Named values exposed at the end of a run.
pub type Outputs = BTreeMap<String, Value>;

/// Secret material shared with handlers.
#[derive(Clone, Default)]
pub struct Secrets {
    /// Document-level password.
    pub password: String,
    /// Public key installed on cloud-init nodes.
    pub ssh_public_key: Option<String>,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("password", &"***")
            .field("ssh_public_key", &self.ssh_public_key.is_some())
            .finish()
    }
}

/// One VM a unit runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Role the VM belongs to.
    pub group: String,
    /// Hypervisor handle.
    pub vm: VmHandle,
    /// SSH target, `None` when the address comes from DHCP.
    pub host: Option<RemoteHost>,
}

/// Everything a handler sees while running one unit.
pub struct UnitContext<'a> {
    /// The unit being executed.
    pub unit: &'a WorkUnit,
    /// Nodes of the unit's groups, in group then creation order.
    pub nodes: Vec<Node>,
    /// Shared run-scoped values.
    pub deps: &'a mut DependencyMap,
    /// Values exposed when the run ends.
    pub outputs: &'a mut Outputs,
    /// Script runner.
    pub remote: &'a dyn RemoteExecutor,
    /// Shared secrets.
    pub secrets: &'a Secrets,
}

impl UnitContext<'_> {
    /// Unit id, used as requester in dependency errors.
    #[must_use]
    pub fn requester(&self) -> &str {
        &self.unit.id
    }

    /// SSH targets of every node.
    ///
    /// # Errors
    /// Fails when the unit has no nodes or a node has no known address.
    pub fn hosts(&self) -> Result<Vec<RemoteHost>, HandlerError> {
        hosts_of(self.nodes.iter(), &self.unit.id)
    }

    /// SSH targets of the nodes belonging to `groups`, in `groups` order.
    ///
    /// # Errors
    /// Fails when a selected node has no known address.
    pub fn hosts_in(&self, groups: &[String]) -> Result<Vec<RemoteHost>, HandlerError> {
        let mut hosts = Vec::new();
        for group in groups {
            hosts.extend(hosts_of(
                self.nodes.iter().filter(|n| &n.group == group),
                &self.unit.id,
            )?);
        }
        Ok(hosts)
    }

    /// String setting from the unit config.
    #[must_use]
    pub fn config_str(&self, key: &str, default: &str) -> String {
        self.unit
            .config
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    /// Port setting from the unit config.
    ///
    /// # Errors
    /// Fails when the value is not a valid port number.
    pub fn config_port(&self, key: &str) -> Result<Option<u16>, HandlerError> {
        match self.unit.config.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => port_value(key, value).map(Some),
        }
    }

    /// Distribution named by the `distribution` setting.
    ///
    /// # Errors
    /// Fails on anything other than `k3s` or `rke2`.
    pub fn distribution(&self) -> Result<Distribution, HandlerError> {
        match self.config_str("distribution", "k3s").as_str() {
            "k3s" => Ok(Distribution::K3s),
            "rke2" => Ok(Distribution::Rke2),
            other => Err(HandlerError::Config(format!(
                "unknown distribution '{other}', expected k3s or rke2"
            ))),
        }
    }

    /// Run `script` on `host`.
    ///
    /// # Errors
    /// Propagates the remote failure.
    pub async fn run(&self, host: &RemoteHost, step: &str, script: &str) -> Result<String, HandlerError> {
        info!(unit = %self.unit.id, host = %host.address, step, "Running remote step");
        let stdout = self.remote.run(host, script).await?;
        debug!(unit = %self.unit.id, host = %host.address, step, bytes = stdout.len(), "Remote step finished");
        Ok(stdout)
    }

    /// Publish `value` under `key` for later units.
    ///
    /// # Errors
    /// Fails if another unit already wrote `key`.
    pub fn publish(&mut self, key: impl Into<String>, value: DepValue) -> Result<(), HandlerError> {
        self.deps.insert(key, value)?;
        Ok(())
    }

    /// Expose `value` as run output `name`.
    pub fn export(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.outputs.insert(name.into(), value.into());
    }
}

fn hosts_of<'n>(
    nodes: impl Iterator<Item = &'n Node>,
    unit: &str,
) -> Result<Vec<RemoteHost>, HandlerError> {
    let hosts = nodes
        .map(|node| {
            node.host.clone().ok_or_else(|| {
                HandlerError::Config(format!(
                    "{} in '{}' has no static address to connect to",
                    node.vm.name, node.group
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if hosts.is_empty() {
        return Err(HandlerError::NoNodes(unit.to_string()));
    }
    Ok(hosts)
}

fn port_value(key: &str, value: &Value) -> Result<u16, HandlerError> {
    value
        .as_u64()
        .and_then(|v| u16::try_from(v).ok())
        .filter(|v| *v > 0)
        .ok_or_else(|| HandlerError::Config(format!("'{key}' must be a port number, got {value}")))
}

/// Work performed for one unit type.
#[async_trait]
pub trait UnitHandler: Send + Sync {
    /// Execute the unit.
    async fn handle(&self, ctx: &mut UnitContext<'_>) -> Result<(), HandlerError>;

    /// Dependency keys `handle` will publish for `unit`, checked for
    /// clashes before anything is created.
    fn publishes(&self, unit: &WorkUnit) -> Vec<String> {
        let _ = unit;
        Vec::new()
    }
}

/// Closed set of handlers, keyed by unit type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn UnitHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}

impl HandlerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in handler.
    #[must_use]
    pub fn with_defaults() -> Self {
        use cluster::{ClusterHandler, KubeconfigHandler};

        let mut registry = Self::new();
        registry
            .register("install-haproxy", haproxy::HaproxyHandler)
            .register("haproxy", haproxy::HaproxyHandler)
            .register("install-k3s-server", ClusterHandler::new(Distribution::K3s))
            .register("install-rke2-server", ClusterHandler::new(Distribution::Rke2))
            .register("k3s", ClusterHandler::new(Distribution::K3s))
            .register("rke2", ClusterHandler::new(Distribution::Rke2))
            .register("get-kubeconfig", KubeconfigHandler)
            .register("kubeadm", kubeadm::KubeadmHandler)
            .register("configure-ipxe-boot", harvester::IpxeBootHandler)
            .register("harvester", harvester::HarvesterHandler);
        registry
    }

    /// Register `handler` for `unit_type`, replacing any previous one.
    pub fn register(
        &mut self,
        unit_type: impl Into<String>,
        handler: impl UnitHandler + 'static,
    ) -> &mut Self {
        self.handlers.insert(unit_type.into(), Box::new(handler));
        self
    }

    /// Handler for `unit_type`.
    #[must_use]
    pub fn get(&self, unit_type: &str) -> Option<&dyn UnitHandler> {
        let handler = self.handlers.get(unit_type)?;
        Some(handler.as_ref())
    }

    /// Whether `unit_type` is registered.
    #[must_use]
    pub fn contains(&self, unit_type: &str) -> bool {
        self.handlers.contains_key(unit_type)
    }

    /// Registered types, sorted.
    #[must_use]
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_is_closed() {
        let registry = HandlerRegistry::with_defaults();
        assert_eq!(
            registry.types(),
            vec![
                "configure-ipxe-boot",
                "get-kubeconfig",
                "haproxy",
                "harvester",
                "install-haproxy",
                "install-k3s-server",
                "install-rke2-server",
                "k3s",
                "kubeadm",
                "rke2",
            ]
        );
        assert!(!registry.contains("install-talos"));
    }

    #[test]
    fn test_port_values() {
        assert_eq!(port_value("apiPort", &Value::from(6443)).unwrap(), 6443);
        assert!(port_value("apiPort", &Value::from(70000)).is_err());
        assert!(port_value("apiPort", &Value::from("6443")).is_err());
    }
}
