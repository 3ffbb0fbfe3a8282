//! Proxmox VE API request and response models.
//!
//! Every response is wrapped in a `{"data": ...}` envelope; write
//! endpoints take form-encoded parameters.

use serde::{Deserialize, Serialize};

// ============================================================================
// Common wrapper types
// ============================================================================

/// Proxmox response envelope.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    /// Response data.
    pub data: T,
}

/// Status of a long-running task (UPID).
#[derive(Debug, Deserialize)]
pub struct TaskStatus {
    /// `running` or `stopped`.
    pub status: String,
    /// Exit status once stopped (`OK` on success).
    #[serde(default)]
    pub exitstatus: Option<String>,
}

impl TaskStatus {
    /// Whether the task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    /// Whether the task stopped successfully.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.exitstatus.as_deref() == Some("OK")
    }
}

// ============================================================================
// VM lifecycle parameters
// ============================================================================

/// Parameters for `POST /nodes/{node}/qemu/{template}/clone`.
#[derive(Debug, Serialize)]
pub struct CloneParams {
    /// New VM id.
    pub newid: u32,
    /// New VM name.
    pub name: String,
    /// Target physical host.
    pub target: String,
    /// Full clone (1) rather than linked clone.
    pub full: u8,
}

/// Parameters for `PUT /nodes/{node}/qemu/{vmid}/config` after a clone.
#[derive(Debug, Serialize)]
pub struct CloudInitConfigParams {
    /// CPU cores.
    pub cores: u32,
    /// Memory in MiB.
    pub memory: u64,
    /// CPU model.
    pub cpu: String,
    /// Cloud-init user.
    pub ciuser: String,
    /// URL-encoded public keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sshkeys: Option<String>,
    /// Cloud-init password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cipassword: Option<String>,
    /// `ip=<addr>/<prefix>,gw=<gateway>` or `ip=dhcp`.
    pub ipconfig0: String,
    /// Space separated DNS servers.
    pub nameserver: String,
    /// DNS search domain.
    pub searchdomain: String,
    /// Cloud-init drive.
    pub ide2: String,
    /// Network device.
    pub net0: String,
    /// Start on host boot.
    pub onboot: u8,
}

/// Parameters for `POST /nodes/{node}/qemu` (fresh iPXE VM).
#[derive(Debug, Serialize)]
pub struct CreateVmParams {
    /// VM id.
    pub vmid: u32,
    /// VM name.
    pub name: String,
    /// Memory in MiB.
    pub memory: u64,
    /// CPU cores.
    pub cores: u32,
    /// CPU model.
    pub cpu: String,
    /// Boot disk.
    pub scsi0: String,
    /// Installer ISO.
    pub ide2: String,
    /// Boot order.
    pub boot: String,
    /// Network device.
    pub net0: String,
    /// Guest agent (disabled so no extra cdrom gets attached).
    pub agent: u8,
    /// Start on host boot.
    pub onboot: u8,
}

/// Parameters for `PUT /nodes/{node}/qemu/{vmid}/resize`.
#[derive(Debug, Serialize)]
pub struct ResizeParams {
    /// Disk to resize.
    pub disk: String,
    /// Absolute size (e.g. `32G`).
    pub size: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_deserialization() {
        let json = r#"{"data":{"status":"stopped","exitstatus":"OK","type":"qmclone"}}"#;
        let resp: ApiResponse<TaskStatus> = serde_json::from_str(json).unwrap();
        assert!(!resp.data.is_running());
        assert!(resp.data.is_ok());

        let json = r#"{"data":{"status":"running"}}"#;
        let resp: ApiResponse<TaskStatus> = serde_json::from_str(json).unwrap();
        assert!(resp.data.is_running());
        assert!(!resp.data.is_ok());
    }

    #[test]
    fn test_optional_credentials_are_skipped() {
        let params = CloudInitConfigParams {
            cores: 2,
            memory: 4096,
            cpu: "x86-64-v2-AES".into(),
            ciuser: "ops".into(),
            sshkeys: Some("ssh-ed25519%20AAAA".into()),
            cipassword: None,
            ipconfig0: "ip=dhcp".into(),
            nameserver: "8.8.8.8".into(),
            searchdomain: "local".into(),
            ide2: "local-lvm:cloudinit".into(),
            net0: "virtio,bridge=vmbr0,firewall=1".into(),
            onboot: 0,
        };
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("sshkeys"));
        assert!(!json.contains("cipassword"));
    }
}
