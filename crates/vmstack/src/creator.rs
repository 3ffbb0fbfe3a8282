//! VM creation with bounded retry.
//!
//! [`plan_requests`] turns the description into an ordered list of
//! [`VmRequest`]s, [`create_with_retry`] creates one of them and
//! [`create_fleet`] creates them all in order.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::{AuthMethod, Backoff, BootMethod, ClusterConfig, VmCreationConfig};
use crate::error::{ConfigError, CreateError};
use crate::providers::{
    BootSpec, Credentials, Hypervisor, IpxeRole, ProviderError, VmHandle, VmRequest,
};

/// Creation timeout for the node that bootstraps an iPXE cluster.
const IPXE_CREATE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Creation timeout for iPXE nodes joining an existing cluster.
const IPXE_JOIN_TIMEOUT: Duration = Duration::from_secs(45 * 60);

/// Prefix length used for static addresses.
const ADDRESS_PREFIX: u8 = 24;

/// Retry policy for a single VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Base delay between attempts.
    pub delay: Duration,
    /// Delay growth.
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt`, saturating at
    /// `Duration::MAX`.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Linear => self.delay.checked_mul(attempt).unwrap_or(Duration::MAX),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&VmCreationConfig::default())
    }
}

impl From<&VmCreationConfig> for RetryPolicy {
    fn from(config: &VmCreationConfig) -> Self {
        Self {
            max_attempts: config.max_retries,
            delay: Duration::from_secs(config.retry_delay_secs),
            backoff: config.backoff,
        }
    }
}

/// Build the creation requests for every group, in creation order.
///
/// iPXE nodes are spread round-robin over `config.hosts` and every join node
/// waits for its group's create node. Cloud-init nodes cloned from the same
/// template onto the same host are chained so that only one clone holds the
/// template's storage lock at a time.
///
/// # Errors
/// Fails when a group needs an SSH key and `ssh_public_key` is `None`, or
/// when a group is missing fields `validate` would also reject.
pub fn plan_requests(
    config: &ClusterConfig,
    ssh_public_key: Option<&str>,
) -> Result<Vec<VmRequest>, ConfigError> {
    let mut requests = Vec::new();
    let mut last_clone: HashMap<(u32, String), String> = HashMap::new();

    for group in &config.vms {
        for index in 0..group.count {
            let name = group.vm_name(index);
            let (node, boot, after, timeout) = match group.boot_method {
                BootMethod::CloudInit => {
                    let template_id = group.template_id.ok_or_else(|| ConfigError::MissingField {
                        context: format!("group '{}'", group.name),
                        field: "templateId".into(),
                    })?;
                    let node = group
                        .proxmox_node
                        .clone()
                        .unwrap_or_else(|| "proxmox-1".to_string());
                    let credentials = match group.auth_method {
                        AuthMethod::SshKey => Credentials::SshKey(
                            ssh_public_key
                                .ok_or_else(|| ConfigError::MissingField {
                                    context: format!("group '{}'", group.name),
                                    field: "SSH_PUBLIC_KEY".into(),
                                })?
                                .trim()
                                .to_string(),
                        ),
                        AuthMethod::Password => Credentials::Password(config.password.clone()),
                    };
                    let address = if group.is_static() {
                        let ip = group.ips.get(index).ok_or_else(|| {
                            ConfigError::InsufficientAddresses {
                                group: group.name.clone(),
                                needed: group.count,
                                available: group.ips.len(),
                            }
                        })?;
                        Some(format!("{ip}/{ADDRESS_PREFIX}"))
                    } else {
                        None
                    };
                    let boot = BootSpec::CloudInit {
                        template_id,
                        user: group.username.clone().unwrap_or_default(),
                        credentials,
                        gateway: address.as_ref().and(group.gateway.clone()),
                        address,
                    };
                    let after = last_clone.insert((template_id, node.clone()), name.clone());
                    (node, boot, after, None)
                }
                BootMethod::Ipxe => {
                    let ipxe = group.ipxe_config.as_ref().ok_or_else(|| ConfigError::MissingField {
                        context: format!("group '{}'", group.name),
                        field: "ipxeConfig".into(),
                    })?;
                    let (iso, role) = ipxe.iso_for(&group.name, index, group.count)?;
                    let node = config
                        .hosts
                        .get(index % config.hosts.len().max(1))
                        .cloned()
                        .unwrap_or_else(|| "proxmox-1".to_string());
                    let (after, timeout) = match role {
                        IpxeRole::Join => (Some(group.vm_name(0)), IPXE_JOIN_TIMEOUT),
                        IpxeRole::Single | IpxeRole::Create => (None, IPXE_CREATE_TIMEOUT),
                    };
                    (node, BootSpec::Ipxe { iso, role }, after, Some(timeout))
                }
            };

            requests.push(VmRequest {
                name,
                group: group.name.clone(),
                index,
                node,
                memory_mb: group.memory,
                cores: group.cpu,
                disk_gb: group.disk_size,
                boot,
                after,
                timeout,
            });
        }
    }

    Ok(requests)
}

/// Create one VM, retrying transient failures.
///
/// An attempt cut off by `req.timeout` asks the hypervisor to discard what
/// it created before the next one starts. Returns the handle and the
/// number of attempts it took. Errors the
/// provider classifies as non-retryable end the loop after the failing
/// attempt. `created` holds the names of VMs that already exist; a request
/// whose `after` is not among them is refused without an attempt.
///
/// # Errors
/// Returns `CreateError::Fatal` for non-retryable failures,
/// `CreateError::Exhausted` once `policy.max_attempts` is reached and
/// `CreateError::OrderingViolation` when `after` does not exist yet.
pub async fn create_with_retry(
    hypervisor: &dyn Hypervisor,
    req: &VmRequest,
    policy: &RetryPolicy,
    created: &HashSet<String>,
) -> Result<(VmHandle, u32), CreateError> {
    if let Some(after) = &req.after {
        if !created.contains(after) {
            return Err(CreateError::OrderingViolation {
                vm: req.name.clone(),
                after: after.clone(),
            });
        }
    }

    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        info!(vm = %req.name, node = %req.node, attempt, max_attempts, "Creating VM");

        let result = match req.timeout {
            Some(limit) => match tokio::time::timeout(limit, hypervisor.create_vm(req)).await {
                Ok(result) => result,
                Err(_) => {
                    if let Err(e) = hypervisor.discard_partial(req).await {
                        warn!(vm = %req.name, error = %e, "Failed to remove timed out VM");
                    }
                    Err(ProviderError::Timeout(limit.as_secs()))
                }
            },
            None => hypervisor.create_vm(req).await,
        };

        match result {
            Ok(handle) => {
                info!(vm = %handle, attempts = attempt, "VM created");
                return Ok((handle, attempt));
            }
            Err(e) if !e.is_retryable() => {
                error!(vm = %req.name, error = %e, "VM creation failed permanently");
                return Err(CreateError::Fatal {
                    vm: req.name.clone(),
                    source: e,
                });
            }
            Err(e) if attempt >= max_attempts => {
                error!(vm = %req.name, attempts = attempt, error = %e, "Giving up on VM");
                return Err(CreateError::Exhausted {
                    vm: req.name.clone(),
                    attempts: attempt,
                    source: e,
                });
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    vm = %req.name,
                    attempt,
                    error = %e,
                    "VM creation failed, retrying in {delay:?}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Create every request in order.
///
/// # Errors
/// Stops at the first VM that cannot be created. VMs created before it are
/// left in place.
pub async fn create_fleet(
    hypervisor: &dyn Hypervisor,
    requests: &[VmRequest],
    policy: &RetryPolicy,
) -> Result<Vec<VmHandle>, CreateError> {
    let mut created = HashSet::new();
    let mut handles = Vec::with_capacity(requests.len());
    for req in requests {
        let (handle, _) = create_with_retry(hypervisor, req, policy, &created).await?;
        created.insert(req.name.clone());
        handles.push(handle);
    }
    info!(count = handles.len(), "All VMs created");
    Ok(handles)
}
