//! Cluster description.
//!
//! A single YAML document lists node groups, the actions each group runs
//! once its VMs exist, and optional cluster-wide services. Defaults are
//! filled in by [`ClusterConfig::apply_defaults`] and the document is
//! checked by [`ClusterConfig::validate`] before anything is created.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ConfigError;
use crate::providers::IpxeRole;

/// Physical hosts used when none are listed.
const DEFAULT_HOSTS: [&str; 3] = ["proxmox-1", "proxmox-2", "proxmox-3"];

/// Host cloud-init groups land on when none is given.
const DEFAULT_PROXMOX_NODE: &str = "proxmox-1";

/// Login user for cloud-init groups when none is given.
const DEFAULT_USERNAME: &str = "ubuntu";

// =============================================================================
// Document
// =============================================================================

/// Root of the cluster description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Password for password-authenticated groups.
    #[serde(default)]
    pub password: String,
    /// Default gateway for static addresses.
    pub gateway: String,
    /// User for remote sessions, defaults to each group's `username`.
    #[serde(default)]
    pub ssh_user: Option<String>,
    /// Physical hosts iPXE nodes are spread over.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Creation retry settings.
    #[serde(default)]
    pub vm_creation: VmCreationConfig,
    /// Node groups in declaration order.
    pub vms: Vec<NodeGroupSpec>,
    /// Cluster-wide services.
    #[serde(default)]
    pub services: Services,
}

/// Retry settings for VM creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmCreationConfig {
    /// Maximum attempts per VM.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay between attempts.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Delay growth between attempts.
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for VmCreationConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            backoff: Backoff::default(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    10
}

fn default_count() -> usize {
    1
}

/// Delay growth between creation attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry.
    #[default]
    Fixed,
    /// `attempt * base` before retry `attempt + 1`.
    Linear,
}

// =============================================================================
// Node groups
// =============================================================================

/// How a group's VMs boot the first time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootMethod {
    /// Clone of a cloud-init template.
    #[default]
    CloudInit,
    /// Installer ISO chained to an iPXE boot server.
    Ipxe,
}

/// How a group's VMs get addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpConfigMode {
    /// Addresses from the group's `ips` list.
    Static,
    /// Addresses from DHCP, unknown to the orchestrator.
    Dhcp,
}

/// How the login user authenticates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    /// Public key from `SSH_PUBLIC_KEY`.
    #[default]
    SshKey,
    /// Document-level `password`.
    Password,
}

/// One group of identical VMs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupSpec {
    /// Group name, also the VM name prefix.
    pub name: String,
    /// Role used for grouping and dependency keys, defaults to `name`.
    #[serde(default)]
    pub role: Option<String>,
    /// Number of VMs.
    #[serde(default = "default_count")]
    pub count: usize,
    /// Template VM id for cloud-init groups.
    #[serde(default)]
    pub template_id: Option<u32>,
    /// Memory in MiB.
    pub memory: u64,
    /// CPU cores.
    pub cpu: u32,
    /// Disk size in GiB.
    pub disk_size: u64,
    /// Static addresses, positionally aligned with the group's VMs.
    #[serde(default)]
    pub ips: Vec<String>,
    /// Addressing mode.
    #[serde(default)]
    pub ipconfig: Option<IpConfigMode>,
    /// Gateway, defaults to the document gateway.
    #[serde(default)]
    pub gateway: Option<String>,
    /// Login user.
    #[serde(default)]
    pub username: Option<String>,
    /// Login authentication.
    #[serde(default)]
    pub auth_method: AuthMethod,
    /// Physical host for cloud-init groups.
    #[serde(default)]
    pub proxmox_node: Option<String>,
    /// Boot method.
    #[serde(default)]
    pub boot_method: BootMethod,
    /// iPXE settings, required for iPXE groups.
    #[serde(default)]
    pub ipxe_config: Option<IpxeConfig>,
    /// Actions run once the group exists.
    #[serde(default)]
    pub actions: Vec<UnitSpec>,
}

impl NodeGroupSpec {
    /// Role name, falling back to the group name.
    #[must_use]
    pub fn role(&self) -> &str {
        self.role.as_deref().unwrap_or(&self.name)
    }

    /// Whether the group has static addresses.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.ipconfig == Some(IpConfigMode::Static)
    }

    /// VM name for position `index`.
    #[must_use]
    pub fn vm_name(&self, index: usize) -> String {
        format!("{}-{index}", self.name)
    }
}

/// iPXE installer settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpxeConfig {
    /// Base URL of the boot server.
    #[serde(default)]
    pub boot_server_url: String,
    /// Installed OS (only `harvester` today).
    #[serde(default)]
    pub os_type: String,
    /// OS version.
    #[serde(default)]
    pub version: String,
    /// Extra kernel parameters.
    #[serde(default)]
    pub kernel_params: Vec<String>,
    /// Installer ISOs on the ISO datastore.
    #[serde(default)]
    pub iso_files: Vec<String>,
}

impl IpxeConfig {
    /// ISO and cluster position for node `index` of a `count`-node group.
    ///
    /// A lone ISO only serves a single node. Otherwise node 0 takes the
    /// first ISO named like create/master/init and every other node the
    /// first named like join/worker/add. When names carry no hint, ISOs
    /// are taken by position.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` when no ISO fits the position.
    pub fn iso_for(
        &self,
        group: &str,
        index: usize,
        count: usize,
    ) -> Result<(String, IpxeRole), ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            context: format!("group '{group}' ipxeConfig"),
            reason,
        };

        match self.iso_files.as_slice() {
            [] => Err(invalid("at least one ISO is required".into())),
            [only] if count <= 1 => Ok((only.clone(), IpxeRole::Single)),
            [_] => Err(invalid(format!(
                "one ISO cannot serve {count} nodes, provide a create and a join ISO"
            ))),
            isos => {
                let matching = |patterns: &[&str]| {
                    isos.iter().find(|iso| {
                        let lower = iso.to_lowercase();
                        patterns.iter().any(|p| lower.contains(p))
                    })
                };
                let create = matching(&["create", "master", "init"]).or_else(|| isos.first());
                let join = matching(&["join", "worker", "add"]).or_else(|| isos.get(1));

                let (iso, role) = if index == 0 {
                    (create, IpxeRole::Create)
                } else {
                    (join, IpxeRole::Join)
                };
                iso.map(|iso| (iso.clone(), role))
                    .ok_or_else(|| invalid(format!("no ISO for {role} node")))
            }
        }
    }
}

// =============================================================================
// Units and services
// =============================================================================

/// A declared action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitSpec {
    /// Explicit unit id, defaults to `<role>-<type>`.
    #[serde(default)]
    pub id: Option<String>,
    /// Handler type.
    #[serde(rename = "type")]
    pub unit_type: String,
    /// Unit ids or roles that must complete first.
    #[serde(default, alias = "depends-on")]
    pub depends_on: Vec<String>,
    /// Handler-specific settings.
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Settings for one cluster-wide service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Whether the service runs.
    #[serde(default)]
    pub enabled: bool,
    /// Groups the service runs on.
    #[serde(default)]
    pub targets: Vec<String>,
    /// Control plane groups.
    #[serde(default, rename = "control-plane", alias = "controlPlane")]
    pub control_plane: Vec<String>,
    /// Worker groups.
    #[serde(default)]
    pub workers: Vec<String>,
    /// Load balancer groups.
    #[serde(default, alias = "loadBalancer")]
    pub loadbalancer: Vec<String>,
    /// Group whose addresses become load balancer backends.
    #[serde(default, alias = "backend-discovery")]
    pub backend_discovery: Option<String>,
    /// Unit ids or roles that must complete first.
    #[serde(default, alias = "depends-on")]
    pub depends_on: Vec<String>,
    /// Handler-specific settings.
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl ServiceSpec {
    /// Every group the service touches, deduplicated in declaration order.
    #[must_use]
    pub fn node_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = Vec::new();
        for group in self
            .targets
            .iter()
            .chain(&self.control_plane)
            .chain(&self.workers)
            .chain(&self.loadbalancer)
        {
            if !groups.contains(group) {
                groups.push(group.clone());
            }
        }
        groups
    }
}

/// Optional services, keyed by handler type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Services {
    #[serde(default)]
    pub haproxy: Option<ServiceSpec>,
    #[serde(default)]
    pub k3s: Option<ServiceSpec>,
    #[serde(default)]
    pub rke2: Option<ServiceSpec>,
    #[serde(default)]
    pub kubeadm: Option<ServiceSpec>,
    #[serde(default)]
    pub harvester: Option<ServiceSpec>,
}

impl Services {
    /// Enabled services in a fixed order.
    #[must_use]
    pub fn enabled(&self) -> Vec<(&'static str, &ServiceSpec)> {
        [
            ("haproxy", &self.haproxy),
            ("k3s", &self.k3s),
            ("rke2", &self.rke2),
            ("kubeadm", &self.kubeadm),
            ("harvester", &self.harvester),
        ]
        .into_iter()
        .filter_map(|(name, spec)| spec.as_ref().filter(|s| s.enabled).map(|s| (name, s)))
        .collect()
    }
}

// =============================================================================
// Loading
// =============================================================================

impl ClusterConfig {
    /// Read, parse and default a description file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        debug!(path = %path.display(), "Loaded cluster description");
        Self::from_yaml(&contents)
    }

    /// Parse and default a description.
    ///
    /// # Errors
    /// Returns an error if the YAML does not match the schema.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(contents)?;
        config.apply_defaults();
        Ok(config)
    }

    /// Fill in every optional setting.
    pub fn apply_defaults(&mut self) {
        if self.hosts.is_empty() {
            self.hosts = DEFAULT_HOSTS.iter().map(ToString::to_string).collect();
        }
        for group in &mut self.vms {
            if group.ipconfig.is_none() {
                group.ipconfig = Some(match group.boot_method {
                    BootMethod::CloudInit => IpConfigMode::Static,
                    BootMethod::Ipxe => IpConfigMode::Dhcp,
                });
            }
            if group.gateway.is_none() {
                group.gateway = Some(self.gateway.clone());
            }
            if group.username.is_none() {
                group.username = Some(
                    self.ssh_user
                        .clone()
                        .unwrap_or_else(|| DEFAULT_USERNAME.to_string()),
                );
            }
            if group.proxmox_node.is_none() {
                group.proxmox_node = Some(DEFAULT_PROXMOX_NODE.to_string());
            }
        }
    }

    /// Check the document for mistakes no retry can fix.
    ///
    /// # Errors
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vm_creation.max_retries == 0 {
            return Err(ConfigError::Invalid {
                context: "vmCreation.maxRetries".into(),
                reason: "must be at least 1".into(),
            });
        }

        let mut names: Vec<&str> = Vec::new();
        for group in &self.vms {
            if group.name.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    context: "vms".into(),
                    field: "name".into(),
                });
            }
            if names.contains(&group.name.as_str()) {
                return Err(ConfigError::Invalid {
                    context: format!("group '{}'", group.name),
                    reason: "group names must be unique".into(),
                });
            }
            names.push(&group.name);

            match group.boot_method {
                BootMethod::CloudInit => Self::validate_cloud_init(group)?,
                BootMethod::Ipxe => Self::validate_ipxe(group)?,
            }
        }

        let password_needed = self.vms.iter().any(|g| {
            g.auth_method == AuthMethod::Password && g.boot_method == BootMethod::CloudInit
        });
        if password_needed && self.password.is_empty() {
            return Err(ConfigError::MissingField {
                context: "cluster description".into(),
                field: "password".into(),
            });
        }

        Ok(())
    }

    fn validate_cloud_init(group: &NodeGroupSpec) -> Result<(), ConfigError> {
        if group.template_id.is_none() {
            return Err(ConfigError::MissingField {
                context: format!("group '{}'", group.name),
                field: "templateId".into(),
            });
        }
        if !group.is_static() {
            return Err(ConfigError::Invalid {
                context: format!("group '{}'", group.name),
                reason: "cloud-init groups need static addresses".into(),
            });
        }
        if group.ips.len() < group.count {
            return Err(ConfigError::InsufficientAddresses {
                group: group.name.clone(),
                needed: group.count,
                available: group.ips.len(),
            });
        }
        Ok(())
    }

    fn validate_ipxe(group: &NodeGroupSpec) -> Result<(), ConfigError> {
        let Some(ipxe) = &group.ipxe_config else {
            return Err(ConfigError::MissingField {
                context: format!("group '{}'", group.name),
                field: "ipxeConfig".into(),
            });
        };
        if group.count == 2 {
            return Err(ConfigError::Invalid {
                context: format!("group '{}'", group.name),
                reason: "a 2-node cluster cannot keep etcd quorum, use 1 or 3+ nodes".into(),
            });
        }
        if group.is_static() && group.ips.len() < group.count {
            return Err(ConfigError::InsufficientAddresses {
                group: group.name.clone(),
                needed: group.count,
                available: group.ips.len(),
            });
        }
        for index in 0..group.count {
            ipxe.iso_for(&group.name, index, group.count)?;
        }
        Ok(())
    }
}
