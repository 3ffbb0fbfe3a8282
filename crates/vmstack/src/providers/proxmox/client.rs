//! Proxmox VE API client implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use super::models::{
    ApiResponse, CloneParams, CloudInitConfigParams, CreateVmParams, ResizeParams, TaskStatus,
};
use crate::providers::traits::{
    BootSpec, Credentials, Hypervisor, IpxeRole, ProviderError, VmHandle, VmRequest,
};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Polling interval when waiting for a task.
const POLL_INTERVAL_SECS: u64 = 5;

/// Upper bound for a single hypervisor task (clone, start, destroy).
const TASK_TIMEOUT_SECS: u64 = 900;

/// Connection and placement settings for a Proxmox cluster.
#[derive(Debug, Clone)]
pub struct ProxmoxConfig {
    /// API endpoint (e.g. `https://pve.lan:8006`).
    pub endpoint: Url,
    /// API token in `user@realm!tokenid=secret` form.
    pub api_token: String,
    /// Host holding the cloud-init templates.
    pub template_node: String,
    /// Datastore for installer ISOs.
    pub iso_storage: String,
    /// Datastore for fresh disks.
    pub disk_storage: String,
    /// Datastore for the cloud-init drive.
    pub cloudinit_storage: String,
    /// Network bridge.
    pub bridge: String,
    /// DNS servers handed to cloud-init.
    pub dns_servers: Vec<String>,
    /// DNS search domain.
    pub search_domain: String,
    /// Accept self-signed certificates.
    pub insecure: bool,
    /// Task polling interval.
    pub poll_interval: Duration,
}

impl ProxmoxConfig {
    /// Create settings with homelab defaults.
    #[must_use]
    pub fn new(endpoint: Url, api_token: impl Into<String>) -> Self {
        Self {
            endpoint,
            api_token: api_token.into(),
            template_node: "proxmox-1".to_string(),
            iso_storage: "nas-storage".to_string(),
            disk_storage: "local-lvm".to_string(),
            cloudinit_storage: "nas-storage".to_string(),
            bridge: "vmbr0".to_string(),
            dns_servers: vec!["192.168.90.1".to_string(), "8.8.8.8".to_string()],
            search_domain: "local".to_string(),
            insecure: false,
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
        }
    }

    /// Set the host holding the templates.
    #[must_use]
    pub fn with_template_node(mut self, node: impl Into<String>) -> Self {
        self.template_node = node.into();
        self
    }

    /// Accept self-signed certificates.
    #[must_use]
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Set the task polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Proxmox VE hypervisor.
#[derive(Clone)]
pub struct Proxmox {
    /// HTTP client.
    client: Client,
    /// Cluster settings.
    config: ProxmoxConfig,
    /// VMs that exist on the cluster but are not fully created yet, by name.
    in_flight: Arc<Mutex<HashMap<String, VmHandle>>>,
}

impl Proxmox {
    /// Create a new Proxmox client.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(config: ProxmoxConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .danger_accept_invalid_certs(config.insecure)
            .build()?;

        Ok(Self {
            client,
            config,
            in_flight: Arc::default(),
        })
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, VmHandle>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `vmid` as belonging to `req` once the cluster accepted it.
    fn track(&self, req: &VmRequest, vmid: u32) {
        let vm = VmHandle {
            vmid,
            name: req.name.clone(),
            node: req.node.clone(),
        };
        self.in_flight().insert(req.name.clone(), vm);
    }

    fn untrack(&self, name: &str) -> Option<VmHandle> {
        self.in_flight().remove(name)
    }

    /// Build an API URL from path segments.
    fn url(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = self.config.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| {
                ProviderError::Config(format!(
                    "endpoint {} cannot carry a path",
                    self.config.endpoint
                ))
            })?
            .pop_if_empty()
            .extend(["api2", "json"])
            .extend(segments);
        Ok(url)
    }

    fn auth_header(&self) -> String {
        format!("PVEAPIToken={}", self.config.api_token)
    }

    /// Make an authenticated GET request.
    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ProviderError> {
        let url = self.url(segments)?;
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(url)
            .header("Authorization", self.auth_header())
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated form POST request.
    async fn post<T, B>(&self, segments: &[&str], body: &B) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.url(segments)?;
        debug!(url = %url, "POST request");

        let response = self
            .client
            .post(url)
            .header("Authorization", self.auth_header())
            .form(body)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated form PUT request.
    async fn put<T, B>(&self, segments: &[&str], body: &B) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.url(segments)?;
        debug!(url = %url, "PUT request");

        let response = self
            .client
            .put(url)
            .header("Authorization", self.auth_header())
            .form(body)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated DELETE request.
    async fn delete<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ProviderError> {
        let mut url = self.url(segments)?;
        url.query_pairs_mut().append_pair("purge", "1");
        debug!(url = %url, "DELETE request");

        let response = self
            .client
            .delete(url)
            .header("Authorization", self.auth_header())
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Handle API response, parsing JSON or error.
    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                ProviderError::Serialization(e)
            })
        } else if status == StatusCode::NOT_FOUND {
            Err(ProviderError::NotFound(text))
        } else {
            Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    /// Ask the cluster for the next free VM id.
    async fn next_vmid(&self) -> Result<u32, ProviderError> {
        let response: ApiResponse<serde_json::Value> = self.get(&["cluster", "nextid"]).await?;
        let parsed = match &response.data {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            _ => None,
        };
        parsed.ok_or_else(|| ProviderError::Api {
            status: 200,
            message: format!("unexpected nextid payload: {}", response.data),
        })
    }

    /// Poll a task until it stops.
    async fn wait_task(&self, node: &str, upid: &str, vm: &str) -> Result<(), ProviderError> {
        let start = Instant::now();
        let timeout = Duration::from_secs(TASK_TIMEOUT_SECS);

        loop {
            let response: ApiResponse<TaskStatus> =
                self.get(&["nodes", node, "tasks", upid, "status"]).await?;
            let task = response.data;

            debug!(
                upid = %upid,
                status = %task.status,
                elapsed_secs = start.elapsed().as_secs(),
                "Polling task status"
            );

            if !task.is_running() {
                if task.is_ok() {
                    return Ok(());
                }
                let exit_status = task.exitstatus.unwrap_or_default();
                if is_disk_resize_failure(&exit_status) {
                    return Err(ProviderError::DiskResize {
                        vm: vm.to_string(),
                        message: exit_status,
                    });
                }
                return Err(ProviderError::TaskFailed {
                    upid: upid.to_string(),
                    exit_status,
                });
            }

            if start.elapsed() > timeout {
                return Err(ProviderError::Timeout(TASK_TIMEOUT_SECS));
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    fn net0(&self) -> String {
        format!("virtio,bridge={},firewall=1", self.config.bridge)
    }

    async fn create_cloud_init(&self, vmid: u32, req: &VmRequest) -> Result<(), ProviderError> {
        let BootSpec::CloudInit {
            template_id,
            user,
            credentials,
            address,
            gateway,
        } = &req.boot
        else {
            return Err(ProviderError::Config(format!(
                "{} is not a cloud-init request",
                req.name
            )));
        };
        let template_node = self.config.template_node.as_str();
        let template = template_id.to_string();
        let id = vmid.to_string();

        let clone = CloneParams {
            newid: vmid,
            name: req.name.clone(),
            target: req.node.clone(),
            full: 1,
        };
        let upid: ApiResponse<String> = self
            .post(&["nodes", template_node, "qemu", &template, "clone"], &clone)
            .await?;
        self.track(req, vmid);
        self.wait_task(template_node, &upid.data, &req.name).await?;
        debug!(vm = %req.name, vmid, template_id = *template_id, "Clone finished");

        let (sshkeys, cipassword) = match credentials {
            Credentials::SshKey(key) => (Some(encode_ssh_key(key)), None),
            Credentials::Password(password) => (None, Some(password.clone())),
        };
        let ipconfig0 = match (address.as_deref(), gateway.as_deref()) {
            (Some(addr), Some(gw)) => format!("ip={addr},gw={gw}"),
            (Some(addr), None) => format!("ip={addr}"),
            (None, _) => "ip=dhcp".to_string(),
        };
        let params = CloudInitConfigParams {
            cores: req.cores,
            memory: req.memory_mb,
            cpu: "x86-64-v2-AES".to_string(),
            ciuser: user.clone(),
            sshkeys,
            cipassword,
            ipconfig0,
            nameserver: self.config.dns_servers.join(" "),
            searchdomain: self.config.search_domain.clone(),
            ide2: format!("{}:cloudinit", self.config.cloudinit_storage),
            net0: self.net0(),
            onboot: 0,
        };
        let _: ApiResponse<serde_json::Value> = self
            .put(&["nodes", &req.node, "qemu", &id, "config"], &params)
            .await?;

        let resize = ResizeParams {
            disk: "scsi0".to_string(),
            size: format!("{}G", req.disk_gb),
        };
        let resized: Result<ApiResponse<serde_json::Value>, _> = self
            .put(&["nodes", &req.node, "qemu", &id, "resize"], &resize)
            .await;
        match resized {
            Ok(_) => Ok(()),
            Err(ProviderError::Api { message, .. }) if is_disk_resize_failure(&message) => {
                Err(ProviderError::DiskResize {
                    vm: req.name.clone(),
                    message,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn create_ipxe(
        &self,
        vmid: u32,
        req: &VmRequest,
        iso: &str,
        role: IpxeRole,
    ) -> Result<(), ProviderError> {
        info!(vm = %req.name, iso = %iso, role = %role, "Creating iPXE VM");

        let params = CreateVmParams {
            vmid,
            name: req.name.clone(),
            memory: req.memory_mb,
            cores: req.cores,
            // KVM has to be exposed for nested virtualisation
            cpu: "host".to_string(),
            scsi0: format!("{}:{},iothread=1", self.config.disk_storage, req.disk_gb),
            ide2: format!("{}:iso/{iso},media=cdrom", self.config.iso_storage),
            boot: "order=scsi0;ide2;net0".to_string(),
            net0: self.net0(),
            agent: 0,
            onboot: 0,
        };
        let upid: ApiResponse<String> = self.post(&["nodes", &req.node, "qemu"], &params).await?;
        self.track(req, vmid);
        self.wait_task(&req.node, &upid.data, &req.name).await
    }

    /// Create and start `vmid`. The VM is tracked as soon as the cluster
    /// accepted the clone or create call.
    async fn build(&self, vmid: u32, req: &VmRequest) -> Result<(), ProviderError> {
        match &req.boot {
            BootSpec::CloudInit { .. } => self.create_cloud_init(vmid, req).await?,
            BootSpec::Ipxe { iso, role } => self.create_ipxe(vmid, req, iso, *role).await?,
        }
        self.start(&req.node, vmid, &req.name).await
    }

    async fn start(&self, node: &str, vmid: u32, vm: &str) -> Result<(), ProviderError> {
        let id = vmid.to_string();
        let no_params: &[(&str, &str)] = &[];
        let upid: ApiResponse<String> = self
            .post(&["nodes", node, "qemu", &id, "status", "start"], no_params)
            .await?;
        self.wait_task(node, &upid.data, vm).await
    }
}

#[async_trait]
impl Hypervisor for Proxmox {
    async fn create_vm(&self, req: &VmRequest) -> Result<VmHandle, ProviderError> {
        let vmid = self.next_vmid().await?;
        info!(vm = %req.name, vmid, node = %req.node, "Creating VM");

        if let Err(e) = self.build(vmid, req).await {
            if let Err(cleanup) = self.discard_partial(req).await {
                warn!(vm = %req.name, vmid, error = %cleanup, "Failed to remove partially created VM");
            }
            return Err(e);
        }
        self.untrack(&req.name);

        let handle = VmHandle {
            vmid,
            name: req.name.clone(),
            node: req.node.clone(),
        };
        info!(vm = %handle, "VM started");
        Ok(handle)
    }

    async fn delete_vm(&self, vm: &VmHandle) -> Result<(), ProviderError> {
        info!(vm = %vm, "Deleting VM");
        let id = vm.vmid.to_string();
        let no_params: &[(&str, &str)] = &[];

        let stopped: Result<ApiResponse<String>, _> = self
            .post(&["nodes", &vm.node, "qemu", &id, "status", "stop"], no_params)
            .await;
        match stopped {
            Ok(upid) => self.wait_task(&vm.node, &upid.data, &vm.name).await?,
            Err(ProviderError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        }

        let upid: ApiResponse<String> = self.delete(&["nodes", &vm.node, "qemu", &id]).await?;
        self.wait_task(&vm.node, &upid.data, &vm.name).await?;
        info!(vm = %vm, "VM deleted");
        Ok(())
    }

    async fn discard_partial(&self, req: &VmRequest) -> Result<(), ProviderError> {
        let Some(vm) = self.untrack(&req.name) else {
            return Ok(());
        };
        warn!(vm = %vm, "Removing partially created VM");
        self.delete_vm(&vm).await
    }
}

/// Proxmox expects `sshkeys` percent-encoded with `%20` for spaces.
fn encode_ssh_key(key: &str) -> String {
    url::form_urlencoded::byte_serialize(key.trim().as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

fn is_disk_resize_failure(message: &str) -> bool {
    message.contains("disk resize failure") || message.contains("shrinking disks is not supported")
}
