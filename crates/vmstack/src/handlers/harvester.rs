//! Harvester installs over iPXE.
//!
//! Harvester nodes boot from the network and install themselves, so these
//! handlers run nothing remotely. They resolve what the boot server must
//! serve and hand it to later units and the run outputs.

use async_trait::async_trait;
use tracing::info;

use super::{UnitContext, UnitHandler};
use crate::config::BootMethod;
use crate::deps::DepValue;
use crate::error::HandlerError;
use crate::executor::{UnitScope, WorkUnit};
use crate::scripts::{self, HarvesterInstall};

/// Harvester release installed when none is configured.
pub const DEFAULT_VERSION: &str = "v1.4.1";

/// Boot server used when none is configured.
pub const DEFAULT_BOOT_SERVER_URL: &str = "http://192.168.90.1:8080";

const IPXE_SCRIPT_KEY: &str = "ipxe-script";
const BOOT_SCRIPT_KEY: &str = "harvester-boot-script";

fn or_default(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

/// Checks an iPXE group against its boot settings.
///
/// Publishes `<role>-ipxe-script` with the script URL.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpxeBootHandler;

#[async_trait]
impl UnitHandler for IpxeBootHandler {
    async fn handle(&self, ctx: &mut UnitContext<'_>) -> Result<(), HandlerError> {
        let ipxe = match &ctx.unit.scope {
            UnitScope::Action {
                boot_method: BootMethod::Ipxe,
                ipxe: Some(ipxe),
            } => ipxe,
            _ => {
                return Err(HandlerError::Config(format!(
                    "'{}' only applies to groups booting over iPXE",
                    ctx.unit.unit_type
                )));
            }
        };

        let install = HarvesterInstall {
            version: or_default(&ipxe.version, DEFAULT_VERSION),
            boot_server_url: or_default(&ipxe.boot_server_url, DEFAULT_BOOT_SERVER_URL),
            vip: String::new(),
            password: String::new(),
            ssh_keys: Vec::new(),
            kernel_params: ipxe.kernel_params.clone(),
        };
        let url = install.script_url();
        for node in &ctx.nodes {
            info!(
                unit = %ctx.unit.id,
                vm = %node.vm,
                script = %url,
                "Node boots from iPXE script"
            );
        }
        let key = ctx.unit.scoped_key(IPXE_SCRIPT_KEY);
        ctx.publish(key, DepValue::Str(url))
    }

    fn publishes(&self, unit: &WorkUnit) -> Vec<String> {
        vec![unit.scoped_key(IPXE_SCRIPT_KEY)]
    }
}

/// Harvester cluster bootstrapped from iPXE-booted nodes.
///
/// Settings: `version`, `boot-server-url`, and `vip` to render the install
/// config (exported as `harvester-config`). Publishes
/// `harvester-boot-script`. Both keys carry the role prefix when run as an
/// action.
#[derive(Debug, Clone, Copy, Default)]
pub struct HarvesterHandler;

#[async_trait]
impl UnitHandler for HarvesterHandler {
    async fn handle(&self, ctx: &mut UnitContext<'_>) -> Result<(), HandlerError> {
        let vip = ctx.config_str("vip", "");
        let install = HarvesterInstall {
            version: ctx.config_str("version", DEFAULT_VERSION),
            boot_server_url: ctx.config_str("boot-server-url", DEFAULT_BOOT_SERVER_URL),
            vip: vip.clone(),
            password: ctx.secrets.password.clone(),
            ssh_keys: ctx.secrets.ssh_public_key.iter().cloned().collect(),
            kernel_params: Vec::new(),
        };
        let url = install.script_url();

        info!(
            unit = %ctx.unit.id,
            version = %install.version,
            boot_server = %install.boot_server_url,
            script = %url,
            vms = ctx.nodes.len(),
            "Harvester nodes install from the boot server"
        );

        if !vip.is_empty() {
            let name = ctx.unit.scoped_key("harvester-config");
            ctx.export(name, scripts::harvester_config(&install));
        }
        let key = ctx.unit.scoped_key(BOOT_SCRIPT_KEY);
        ctx.publish(key, DepValue::Str(url))
    }

    fn publishes(&self, unit: &WorkUnit) -> Vec<String> {
        vec![unit.scoped_key(BOOT_SCRIPT_KEY)]
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::{IpxeConfig, ServiceSpec};
    use crate::deps::DependencyMap;
    use crate::handlers::testing::{node, RecordingRemote};
    use crate::handlers::{Outputs, Secrets};

    fn ipxe_action(boot_method: BootMethod, ipxe: Option<IpxeConfig>) -> WorkUnit {
        WorkUnit {
            id: "harvester-configure-ipxe-boot".into(),
            unit_type: "configure-ipxe-boot".into(),
            role: "harvester".into(),
            depends_on: vec![],
            config: serde_json::Map::new(),
            node_groups: vec!["harvester".into()],
            scope: UnitScope::Action { boot_method, ipxe },
        }
    }

    #[tokio::test]
    async fn test_ipxe_boot_publishes_script_url() {
        let unit = ipxe_action(
            BootMethod::Ipxe,
            Some(IpxeConfig {
                boot_server_url: "http://boot.lan:8080/".into(),
                version: "v1.5.0".into(),
                ..IpxeConfig::default()
            }),
        );
        let remote = RecordingRemote::default();
        let secrets = Secrets::default();
        let mut deps = DependencyMap::new();
        let mut outputs = Outputs::new();
        let mut ctx = UnitContext {
            unit: &unit,
            nodes: vec![node("harvester", 0, "10.0.0.50")],
            deps: &mut deps,
            outputs: &mut outputs,
            remote: &remote,
            secrets: &secrets,
        };
        IpxeBootHandler.handle(&mut ctx).await.unwrap();

        assert_eq!(
            deps.get_str("harvester-ipxe-script", "test").unwrap(),
            "http://boot.lan:8080/boot/harvester-v1.5.0.ipxe"
        );
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_ipxe_boot_rejects_cloud_init_groups() {
        let unit = ipxe_action(BootMethod::CloudInit, None);
        let remote = RecordingRemote::default();
        let secrets = Secrets::default();
        let mut deps = DependencyMap::new();
        let mut outputs = Outputs::new();
        let mut ctx = UnitContext {
            unit: &unit,
            nodes: vec![],
            deps: &mut deps,
            outputs: &mut outputs,
            remote: &remote,
            secrets: &secrets,
        };
        let err = IpxeBootHandler.handle(&mut ctx).await.unwrap_err();
        assert!(matches!(err, HandlerError::Config(_)));
    }

    #[tokio::test]
    async fn test_service_defaults_and_install_config() {
        let spec = ServiceSpec {
            enabled: true,
            targets: vec!["harvester".into()],
            config: json!({ "vip": "192.168.90.200" })
                .as_object()
                .cloned()
                .unwrap(),
            ..ServiceSpec::default()
        };
        let unit = WorkUnit {
            id: "harvester".into(),
            unit_type: "harvester".into(),
            role: "harvester".into(),
            depends_on: vec![],
            config: spec.config.clone(),
            node_groups: spec.node_groups(),
            scope: UnitScope::Service(spec),
        };
        let remote = RecordingRemote::default();
        let secrets = Secrets {
            password: "hunter2".into(),
            ssh_public_key: Some("ssh-ed25519 AAAA ops".into()),
        };
        let mut deps = DependencyMap::new();
        let mut outputs = Outputs::new();
        let mut ctx = UnitContext {
            unit: &unit,
            nodes: vec![],
            deps: &mut deps,
            outputs: &mut outputs,
            remote: &remote,
            secrets: &secrets,
        };
        HarvesterHandler.handle(&mut ctx).await.unwrap();

        assert_eq!(
            deps.get_str("harvester-boot-script", "test").unwrap(),
            "http://192.168.90.1:8080/boot/harvester-v1.4.1.ipxe"
        );
        let config = outputs["harvester-config"].as_str().unwrap();
        assert!(config.contains("vip: 192.168.90.200"));
        assert!(config.contains("password: \"hunter2\""));
        assert!(config.contains("- \"ssh-ed25519 AAAA ops\""));
    }
}
