//! Hypervisor trait and common types for VM providers.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during hypervisor operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// VM not found.
    #[error("VM not found: {0}")]
    NotFound(String),

    /// Operation timed out.
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// A long-running hypervisor task finished with a non-OK exit status.
    #[error("Task {upid} failed: {exit_status}")]
    TaskFailed { upid: String, exit_status: String },

    /// The requested disk cannot be reconciled with the source template.
    /// Retrying never fixes this, the group definition has to change.
    #[error("disk resize failure on {vm}: {message}")]
    DiskResize { vm: String, message: String },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProviderError {
    /// Whether another attempt at the same request can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::DiskResize { .. } | Self::Config(_))
    }
}

/// Handle to a created VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmHandle {
    /// Hypervisor-assigned VM id.
    pub vmid: u32,
    /// VM name (`<group>-<index>`).
    pub name: String,
    /// Physical host the VM was placed on.
    pub node: String,
}

impl fmt::Display for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}@{})", self.name, self.vmid, self.node)
    }
}

/// Login credentials injected through cloud-init.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Public SSH key.
    SshKey(String),
    /// Plain password.
    Password(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SshKey(_) => f.write_str("SshKey(..)"),
            Self::Password(_) => f.write_str("Password(***)"),
        }
    }
}

/// Position of an iPXE node within its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpxeRole {
    /// Only node of a single-node install.
    Single,
    /// First node, creates the cluster.
    Create,
    /// Subsequent node, joins the cluster.
    Join,
}

impl fmt::Display for IpxeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => write!(f, "SINGLE"),
            Self::Create => write!(f, "CREATE"),
            Self::Join => write!(f, "JOIN"),
        }
    }
}

/// How a VM boots for the first time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootSpec {
    /// Full clone of a cloud-init template.
    CloudInit {
        /// Template VM id.
        template_id: u32,
        /// Login user.
        user: String,
        /// Login credentials.
        credentials: Credentials,
        /// Static address with prefix (e.g. `192.168.90.10/24`), `None` for DHCP.
        address: Option<String>,
        /// Default gateway for the static address.
        gateway: Option<String>,
    },
    /// Fresh VM booting an installer ISO.
    Ipxe {
        /// ISO file name on the ISO datastore.
        iso: String,
        /// Cluster position.
        role: IpxeRole,
    },
}

/// Request to create one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRequest {
    /// VM name (`<group>-<index>`).
    pub name: String,
    /// Declaring group.
    pub group: String,
    /// Position within the group.
    pub index: usize,
    /// Physical host to place the VM on.
    pub node: String,
    /// Memory in MiB.
    pub memory_mb: u64,
    /// CPU cores.
    pub cores: u32,
    /// Disk size in GiB.
    pub disk_gb: u64,
    /// Boot method.
    pub boot: BootSpec,
    /// Name of a VM that must exist before this one is created.
    pub after: Option<String>,
    /// Per-attempt creation timeout.
    pub timeout: Option<Duration>,
}

/// Trait for hypervisor platforms.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Create (clone or install) a VM and start it.
    ///
    /// A failed call leaves no VM behind.
    async fn create_vm(&self, req: &VmRequest) -> Result<VmHandle, ProviderError>;

    /// Stop and destroy a VM.
    async fn delete_vm(&self, vm: &VmHandle) -> Result<(), ProviderError>;

    /// Destroy whatever a `create_vm` call for `req` that was cancelled
    /// before returning left on the hypervisor.
    async fn discard_partial(&self, req: &VmRequest) -> Result<(), ProviderError> {
        let _ = req;
        Ok(())
    }
}
