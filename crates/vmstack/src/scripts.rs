//! Shell scripts and config files rendered for remote nodes.
//!
//! Everything here is plain string rendering. Scripts are fed to
//! `bash -s` by the remote executor; outputs that a handler reads back
//! (tokens, join commands, kubeconfigs) are the only thing written to
//! stdout.

use std::fmt::Write as _;

/// Resolver written to `/etc/resolv.conf` before installs.
pub const NAMESERVER: &str = "192.168.90.1";

/// Kubernetes API port.
pub const API_PORT: u16 = 6443;

/// RKE2 supervisor port joiners register through.
pub const RKE2_SUPERVISOR_PORT: u16 = 9345;

/// Kubernetes package repository minor version for kubeadm nodes.
const KUBERNETES_REPO: &str = "v1.34";

/// Calico manifest applied after `kubeadm init`.
const CALICO_MANIFEST: &str =
    "https://raw.githubusercontent.com/projectcalico/calico/v3.29.1/manifests/calico.yaml";

/// Where `kubeadm init` leaves the join command.
const KUBEADM_JOIN_FILE: &str = "/tmp/kubeadm-join-command.txt";

fn resolv_conf() -> String {
    format!("sudo tee /etc/resolv.conf > /dev/null << 'EOF'\nnameserver {NAMESERVER}\nEOF\n")
}

// =============================================================================
// HAProxy
// =============================================================================

/// One TCP frontend forwarded to every backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frontend {
    pub name: String,
    pub port: u16,
}

/// Render `haproxy.cfg` balancing each frontend over `backends`.
#[must_use]
pub fn haproxy_config(frontends: &[Frontend], backends: &[String]) -> String {
    let mut cfg = String::from(
        "global
    daemon
    maxconn 4096
    log stdout local0

defaults
    mode tcp
    timeout connect 5000ms
    timeout client 50000ms
    timeout server 50000ms
    option tcplog
    log global
",
    );

    for frontend in frontends {
        let Frontend { name, port } = frontend;
        let _ = write!(
            cfg,
            "
frontend {name}
    bind *:{port}
    mode tcp
    default_backend {name}-servers

backend {name}-servers
    mode tcp
    balance roundrobin
"
        );
        for (i, ip) in backends.iter().enumerate() {
            let _ = writeln!(cfg, "    server server-{} {ip}:{port} check", i + 1);
        }
    }
    cfg
}

/// Install HAProxy and replace its config with `config`.
#[must_use]
pub fn haproxy_install(config: &str) -> String {
    format!(
        "set -e
sudo apt-get update
sudo apt-get install -y haproxy
sudo cp /etc/haproxy/haproxy.cfg /etc/haproxy/haproxy.cfg.backup
sudo tee /etc/haproxy/haproxy.cfg > /dev/null << 'EOF'
{config}EOF
sudo systemctl enable haproxy
sudo systemctl restart haproxy
sudo systemctl is-active haproxy >&2
"
    )
}

// =============================================================================
// K3s and RKE2
// =============================================================================

/// Lightweight Kubernetes distributions sharing the init/join protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    K3s,
    Rke2,
}

impl Distribution {
    /// Handler type and dependency key prefix.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::K3s => "k3s",
            Self::Rke2 => "rke2",
        }
    }

    fn token_file(self) -> &'static str {
        match self {
            Self::K3s => "/var/lib/rancher/k3s/server/node-token",
            Self::Rke2 => "/var/lib/rancher/rke2/server/node-token",
        }
    }

    fn kubeconfig_file(self) -> &'static str {
        match self {
            Self::K3s => "/etc/rancher/k3s/k3s.yaml",
            Self::Rke2 => "/etc/rancher/rke2/rke2.yaml",
        }
    }
}

/// Bootstrap the first server of a cluster behind `lb_ip`.
#[must_use]
pub fn server_init(dist: Distribution, lb_ip: &str) -> String {
    let resolv = resolv_conf();
    match dist {
        Distribution::K3s => format!(
            "set -e
{resolv}curl -sfL https://get.k3s.io | sudo sh -s - server \\
  --cluster-init --tls-san={lb_ip} --tls-san=$(hostname -I | awk '{{print $1}}') \\
  --write-kubeconfig-mode 644 >&2
sudo systemctl enable --now k3s >&2
until sudo k3s kubectl get nodes >/dev/null 2>&1; do sleep 5; done
sudo k3s kubectl wait --for=condition=Ready nodes --all --timeout=300s >&2
"
        ),
        Distribution::Rke2 => format!(
            "set -e
{resolv}sudo mkdir -p /etc/rancher/rke2
sudo tee /etc/rancher/rke2/config.yaml > /dev/null << EOF
cluster-init: true
tls-san:
  - {lb_ip}
  - $(hostname -I | awk '{{print $1}}')
write-kubeconfig-mode: \"0644\"
EOF
curl -sfL https://get.rke2.io | sudo sh - >&2
sudo systemctl enable --now rke2-server.service >&2
until [ -f /etc/rancher/rke2/rke2.yaml ]; do sleep 5; done
sudo /var/lib/rancher/rke2/bin/kubectl --kubeconfig /etc/rancher/rke2/rke2.yaml \\
  wait --for=condition=Ready nodes --all --timeout=300s >&2
"
        ),
    }
}

/// Join an additional server through `lb_ip` with `token`.
#[must_use]
pub fn server_join(dist: Distribution, lb_ip: &str, token: &str) -> String {
    let resolv = resolv_conf();
    match dist {
        Distribution::K3s => format!(
            "set -e
{resolv}until curl -k -s https://{lb_ip}:{API_PORT}/ping >/dev/null; do
  echo \"Waiting for first K3s server\" >&2
  sleep 10
done
curl -sfL https://get.k3s.io | sudo sh -s - server \\
  --server https://{lb_ip}:{API_PORT} \\
  --token {token} \\
  --tls-san={lb_ip} --tls-san=$(hostname -I | awk '{{print $1}}') \\
  --write-kubeconfig-mode 644 >&2
sudo systemctl enable --now k3s >&2
"
        ),
        Distribution::Rke2 => format!(
            "set -e
{resolv}until curl -k -s https://{lb_ip}:{RKE2_SUPERVISOR_PORT}/ping >/dev/null; do
  echo \"Waiting for first RKE2 server\" >&2
  sleep 10
done
sudo mkdir -p /etc/rancher/rke2
sudo tee /etc/rancher/rke2/config.yaml > /dev/null << EOF
server: https://{lb_ip}:{RKE2_SUPERVISOR_PORT}
token: {token}
tls-san:
  - {lb_ip}
  - $(hostname -I | awk '{{print $1}}')
write-kubeconfig-mode: \"0644\"
EOF
curl -sfL https://get.rke2.io | sudo sh - >&2
sudo systemctl enable --now rke2-server.service >&2
"
        ),
    }
}

/// Print the cluster join token.
#[must_use]
pub fn read_token(dist: Distribution) -> String {
    let file = dist.token_file();
    format!(
        "until sudo test -f {file}; do sleep 5; done
sudo cat {file}
"
    )
}

/// Print the admin kubeconfig with the API endpoint moved to `lb_ip`.
#[must_use]
pub fn read_kubeconfig(dist: Distribution, lb_ip: &str) -> String {
    let file = dist.kubeconfig_file();
    format!(
        "until sudo test -f {file}; do
  echo \"Waiting for kubeconfig\" >&2
  sleep 5
done
sudo cat {file} | sed 's/127.0.0.1:{API_PORT}/{lb_ip}:{API_PORT}/g'
"
    )
}

// =============================================================================
// kubeadm
// =============================================================================

fn kubeadm_prerequisites() -> String {
    format!(
        r"set -e
sudo swapoff -a
sudo sed -i '/ swap / s/^\(.*\)$/#\1/g' /etc/fstab

cat <<EOF | sudo tee /etc/modules-load.d/k8s.conf
overlay
br_netfilter
EOF
sudo modprobe overlay
sudo modprobe br_netfilter

cat <<EOF | sudo tee /etc/sysctl.d/k8s.conf
net.bridge.bridge-nf-call-iptables  = 1
net.bridge.bridge-nf-call-ip6tables = 1
net.ipv4.ip_forward                 = 1
EOF
sudo sysctl --system

sudo apt-get update
sudo apt-get install -y containerd apt-transport-https ca-certificates curl gpg
sudo mkdir -p /etc/containerd
containerd config default | sudo tee /etc/containerd/config.toml > /dev/null
sudo sed -i 's/SystemdCgroup = false/SystemdCgroup = true/' /etc/containerd/config.toml
sudo systemctl restart containerd
sudo systemctl enable containerd

sudo mkdir -p -m 755 /etc/apt/keyrings
curl -fsSL https://pkgs.k8s.io/core:/stable:/{KUBERNETES_REPO}/deb/Release.key \
  | sudo gpg --dearmor --yes -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg
echo 'deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] https://pkgs.k8s.io/core:/stable:/{KUBERNETES_REPO}/deb/ /' \
  | sudo tee /etc/apt/sources.list.d/kubernetes.list
sudo apt-get update
sudo apt-get install -y kubelet kubeadm kubectl
sudo apt-mark hold kubelet kubeadm kubectl
sudo systemctl enable kubelet
"
    )
}

/// Initialise the first control plane node at `ip`.
#[must_use]
pub fn kubeadm_init(ip: &str, pod_cidr: &str, service_cidr: &str) -> String {
    let prereqs = kubeadm_prerequisites();
    format!(
        "{{
{prereqs}
sudo kubeadm init \\
  --pod-network-cidr={pod_cidr} \\
  --service-cidr={service_cidr} \\
  --apiserver-advertise-address={ip} \\
  --control-plane-endpoint={ip}:{API_PORT} \\
  --upload-certs

mkdir -p $HOME/.kube
sudo cp -f /etc/kubernetes/admin.conf $HOME/.kube/config
sudo chown $(id -u):$(id -g) $HOME/.kube/config
kubectl apply -f {CALICO_MANIFEST}
kubeadm token create --print-join-command > {KUBEADM_JOIN_FILE}
}} >&2
"
    )
}

/// Print the join command written by [`kubeadm_init`].
#[must_use]
pub fn kubeadm_join_command() -> String {
    format!("cat {KUBEADM_JOIN_FILE}\n")
}

/// Join a node with `join_command`, as control plane when `control_plane`.
#[must_use]
pub fn kubeadm_join(join_command: &str, control_plane: bool) -> String {
    let prereqs = kubeadm_prerequisites();
    let flag = if control_plane { " --control-plane" } else { "" };
    format!("{{\n{prereqs}\nsudo {join_command}{flag}\n}} >&2\n")
}

// =============================================================================
// Harvester
// =============================================================================

/// Parameters of a Harvester iPXE install.
#[derive(Debug, Clone)]
pub struct HarvesterInstall {
    /// Harvester release, e.g. `v1.4.1`.
    pub version: String,
    /// Boot server hosting `iso/` and `config/`.
    pub boot_server_url: String,
    /// Cluster virtual IP.
    pub vip: String,
    /// Console password.
    pub password: String,
    /// Keys added to `ssh_authorized_keys`.
    pub ssh_keys: Vec<String>,
    /// Extra kernel parameters.
    pub kernel_params: Vec<String>,
}

impl HarvesterInstall {
    /// File name of the iPXE script.
    #[must_use]
    pub fn script_name(&self) -> String {
        format!("harvester-{}.ipxe", self.version)
    }

    /// File name of the install config.
    #[must_use]
    pub fn config_name(&self) -> String {
        format!("harvester-{}-config.yaml", self.version)
    }

    /// URL the iPXE script is served from.
    #[must_use]
    pub fn script_url(&self) -> String {
        format!(
            "{}/boot/{}",
            self.boot_server_url.trim_end_matches('/'),
            self.script_name()
        )
    }
}

/// Render the iPXE script, preferring the boot server over the release mirror.
#[must_use]
pub fn harvester_ipxe(install: &HarvesterInstall) -> String {
    let version = &install.version;
    let server = install.boot_server_url.trim_end_matches('/');
    let config_url = format!("{server}/config/{}", install.config_name());
    let mut params = vec![
        format!("initrd=harvester-{version}-initrd-amd64"),
        "ip=dhcp".to_string(),
        "net.ifnames=1".to_string(),
        "rd.cos.disable".to_string(),
        "rd.noverifyssl".to_string(),
    ];
    params.extend(install.kernel_params.iter().cloned());
    params.push(format!("harvester.install.config_url={config_url}"));
    params.push("harvester.install.automatic=true".to_string());
    let params = params.join(" ");

    format!(
        "#!ipxe
set version {version}
set localbase {server}/iso/harvester/${{version}}
set rancherbase https://releases.rancher.com/harvester/${{version}}

dhcp
echo Booting Harvester ${{version}}

kernel ${{localbase}}/harvester-${{version}}-vmlinuz-amd64 {params} root=live:${{localbase}}/harvester-${{version}}-rootfs-amd64.squashfs || goto rancher_fallback
initrd ${{localbase}}/harvester-${{version}}-initrd-amd64 || goto rancher_fallback
goto boot

:rancher_fallback
kernel ${{rancherbase}}/harvester-${{version}}-vmlinuz-amd64 {params} root=live:${{rancherbase}}/harvester-${{version}}-rootfs-amd64.squashfs
initrd ${{rancherbase}}/harvester-${{version}}-initrd-amd64

:boot
boot
"
    )
}

/// Render the automatic install config for the node creating the cluster.
#[must_use]
pub fn harvester_config(install: &HarvesterInstall) -> String {
    let HarvesterInstall {
        version,
        vip,
        password,
        ..
    } = install;
    let mut keys = String::from("  ssh_authorized_keys:");
    if install.ssh_keys.is_empty() {
        keys.push_str(" []\n");
    } else {
        keys.push('\n');
        for key in &install.ssh_keys {
            let _ = writeln!(keys, "  - \"{key}\"");
        }
    }

    format!(
        "#cloud-config
scheme_version: 1
server_url: https://{vip}:443
token: harvester-cluster-{version}
os:
{keys}  password: \"{password}\"
  hostname: harvester-{version}-main
install:
  mode: create
  management_interface:
    interfaces:
    - name: ens18
    default_route: true
    method: dhcp
  device: /dev/sda
  iso_url: https://releases.rancher.com/harvester/{version}/harvester-{version}-amd64.iso
  vip: {vip}
  vip_mode: static
  data_disk: /dev/sdb
"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haproxy_config_lists_every_backend_per_frontend() {
        let frontends = [
            Frontend {
                name: "kube-api".into(),
                port: 6443,
            },
            Frontend {
                name: "rke2-supervisor".into(),
                port: 9345,
            },
        ];
        let backends = vec!["10.0.0.11".to_string(), "10.0.0.12".into()];
        let cfg = haproxy_config(&frontends, &backends);
        assert!(cfg.contains("frontend kube-api\n    bind *:6443"));
        assert!(cfg.contains("    server server-2 10.0.0.12:9345 check"));
        assert_eq!(cfg.matches(" check").count(), 4);
    }

    #[test]
    fn test_join_scripts_carry_token_and_endpoint() {
        let k3s = server_join(Distribution::K3s, "10.0.0.10", "K10secret");
        assert!(k3s.contains("--server https://10.0.0.10:6443"));
        assert!(k3s.contains("--token K10secret"));

        let rke2 = server_join(Distribution::Rke2, "10.0.0.10", "K10secret");
        assert!(rke2.contains("server: https://10.0.0.10:9345"));
        assert!(rke2.contains("token: K10secret"));
    }

    #[test]
    fn test_kubeconfig_is_pointed_at_load_balancer() {
        let script = read_kubeconfig(Distribution::K3s, "10.0.0.10");
        assert!(script.contains("s/127.0.0.1:6443/10.0.0.10:6443/g"));
        assert!(script.contains("/etc/rancher/k3s/k3s.yaml"));
    }

    #[test]
    fn test_kubeadm_join_flags() {
        let cmd = "kubeadm join 10.0.0.11:6443 --token abc";
        assert!(kubeadm_join(cmd, true).contains("sudo kubeadm join 10.0.0.11:6443 --token abc --control-plane"));
        assert!(!kubeadm_join(cmd, false).contains("--control-plane"));
        assert!(kubeadm_init("10.0.0.11", "10.244.0.0/16", "10.96.0.0/12")
            .contains("--pod-network-cidr=10.244.0.0/16"));
    }

    #[test]
    fn test_harvester_assets() {
        let install = HarvesterInstall {
            version: "v1.4.1".into(),
            boot_server_url: "http://192.168.90.1:8080/".into(),
            vip: "192.168.90.210".into(),
            password: "changeme".into(),
            ssh_keys: vec!["ssh-ed25519 AAAA".into()],
            kernel_params: vec!["console=tty1".into()],
        };
        assert_eq!(install.script_url(), "http://192.168.90.1:8080/boot/harvester-v1.4.1.ipxe");

        let script = harvester_ipxe(&install);
        assert!(script.starts_with("#!ipxe\nset version v1.4.1\n"));
        assert!(script.contains(
            "harvester.install.config_url=http://192.168.90.1:8080/config/harvester-v1.4.1-config.yaml"
        ));
        assert!(script.contains("console=tty1"));
        assert!(script.contains("${rancherbase}/harvester-${version}-initrd-amd64"));

        let config = harvester_config(&install);
        assert!(config.contains("server_url: https://192.168.90.210:443"));
        assert!(config.contains("  - \"ssh-ed25519 AAAA\""));
        let parsed: serde_yaml::Value = serde_yaml::from_str(&config).unwrap();
        assert_eq!(parsed["install"]["mode"].as_str(), Some("create"));
    }
}
