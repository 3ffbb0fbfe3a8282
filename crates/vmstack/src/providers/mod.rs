//! Hypervisor abstractions.

pub mod proxmox;
mod traits;

pub use traits::{
    BootSpec, Credentials, Hypervisor, IpxeRole, ProviderError, VmHandle, VmRequest,
};
