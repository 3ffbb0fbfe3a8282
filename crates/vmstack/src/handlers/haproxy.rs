//! HAProxy load balancer in front of the API servers.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{UnitContext, UnitHandler};
use crate::deps::DepValue;
use crate::error::HandlerError;
use crate::executor::WorkUnit;
use crate::scripts::{self, Frontend, API_PORT};

/// Role whose addresses become backends when an action names none.
const DEFAULT_BACKENDS: &str = "k3s-server";

/// Installs HAProxy on every node of the unit.
///
/// Settings: `apiPort`, `supervisorPort`, `extraPorts` (name to port) and,
/// for actions, `backends` (a role). Services take their backend role from
/// `backend-discovery`. Publishes `<unit>-backends`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HaproxyHandler;

impl HaproxyHandler {
    fn backend_role(ctx: &UnitContext<'_>) -> Result<String, HandlerError> {
        match ctx.unit.service() {
            Some(spec) => spec.backend_discovery.clone().ok_or_else(|| {
                HandlerError::Config("haproxy service needs backend-discovery".into())
            }),
            None => Ok(ctx.config_str("backends", DEFAULT_BACKENDS)),
        }
    }

    fn frontends(ctx: &UnitContext<'_>) -> Result<Vec<Frontend>, HandlerError> {
        let mut frontends = vec![Frontend {
            name: "kube-api".into(),
            port: ctx.config_port("apiPort")?.unwrap_or(API_PORT),
        }];
        if let Some(port) = ctx.config_port("supervisorPort")? {
            frontends.push(Frontend {
                name: "supervisor".into(),
                port,
            });
        }
        match ctx.unit.config.get("extraPorts") {
            None | Some(Value::Null) => {}
            Some(Value::Object(extra)) => {
                for (name, value) in extra {
                    let port = value
                        .as_u64()
                        .and_then(|v| u16::try_from(v).ok())
                        .filter(|v| *v > 0)
                        .ok_or_else(|| {
                            HandlerError::Config(format!("extraPorts.{name} must be a port number"))
                        })?;
                    frontends.push(Frontend {
                        name: name.clone(),
                        port,
                    });
                }
            }
            Some(other) => {
                return Err(HandlerError::Config(format!(
                    "extraPorts must map names to ports, got {other}"
                )));
            }
        }
        Ok(frontends)
    }
}

#[async_trait]
impl UnitHandler for HaproxyHandler {
    async fn handle(&self, ctx: &mut UnitContext<'_>) -> Result<(), HandlerError> {
        let backend_role = Self::backend_role(ctx)?;
        let backends = ctx
            .deps
            .static_addresses(&backend_role, ctx.requester())?
            .to_vec();
        let frontends = Self::frontends(ctx)?;

        // Services also target the backend groups, only the balancers get HAProxy.
        let hosts = match ctx.unit.service() {
            Some(spec) if !spec.loadbalancer.is_empty() => ctx.hosts_in(&spec.loadbalancer)?,
            _ => ctx.hosts()?,
        };

        let config = scripts::haproxy_config(&frontends, &backends);
        let script = scripts::haproxy_install(&config);
        for host in &hosts {
            ctx.run(host, "install-haproxy", &script).await?;
        }

        info!(
            unit = %ctx.unit.id,
            backend_role = %backend_role,
            backends = backends.len(),
            balancers = hosts.len(),
            "HAProxy configured"
        );
        let key = format!("{}-backends", ctx.unit.id);
        ctx.publish(key, DepValue::Strings(backends))
    }

    fn publishes(&self, unit: &WorkUnit) -> Vec<String> {
        vec![format!("{}-backends", unit.id)]
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::{BootMethod, ServiceSpec};
    use crate::deps::{ips_key, DependencyMap};
    use crate::executor::{UnitScope, WorkUnit};
    use crate::handlers::testing::{node, RecordingRemote};
    use crate::handlers::{Outputs, Secrets};

    fn action(config: Value) -> WorkUnit {
        WorkUnit {
            id: "loadbalancer-install-haproxy".into(),
            unit_type: "install-haproxy".into(),
            role: "loadbalancer".into(),
            depends_on: vec!["k3s-server".into()],
            config: config.as_object().cloned().unwrap_or_default(),
            node_groups: vec!["loadbalancer".into()],
            scope: UnitScope::Action {
                boot_method: BootMethod::CloudInit,
                ipxe: None,
            },
        }
    }

    fn deps() -> DependencyMap {
        let mut deps = DependencyMap::new();
        deps.insert(
            ips_key("k3s-server"),
            DepValue::Strings(vec!["10.0.0.11".into(), "10.0.0.12".into()]),
        )
        .unwrap();
        deps
    }

    #[tokio::test]
    async fn test_action_balances_default_backends() {
        let unit = action(json!({ "supervisorPort": 9345 }));
        let remote = RecordingRemote::default();
        let secrets = Secrets::default();
        let mut deps = deps();
        let mut outputs = Outputs::new();
        let mut ctx = UnitContext {
            unit: &unit,
            nodes: vec![node("loadbalancer", 0, "10.0.0.10")],
            deps: &mut deps,
            outputs: &mut outputs,
            remote: &remote,
            secrets: &secrets,
        };
        HaproxyHandler.handle(&mut ctx).await.unwrap();

        let calls = remote.calls();
        assert_eq!(calls.len(), 1);
        let (host, script) = &calls[0];
        assert_eq!(host, "10.0.0.10");
        assert!(script.contains("server server-1 10.0.0.11:6443 check"));
        assert!(script.contains("server server-2 10.0.0.12:9345 check"));
        assert_eq!(
            deps.get_strings("loadbalancer-install-haproxy-backends", "test")
                .unwrap(),
            ["10.0.0.11", "10.0.0.12"]
        );
    }

    #[tokio::test]
    async fn test_service_installs_only_on_balancers() {
        let spec = ServiceSpec {
            enabled: true,
            loadbalancer: vec!["loadbalancer".into()],
            backend_discovery: Some("k3s-server".into()),
            ..ServiceSpec::default()
        };
        let unit = WorkUnit {
            id: "haproxy".into(),
            unit_type: "haproxy".into(),
            role: "haproxy".into(),
            depends_on: vec![],
            config: serde_json::Map::new(),
            node_groups: spec.node_groups(),
            scope: UnitScope::Service(spec),
        };
        let remote = RecordingRemote::default();
        let secrets = Secrets::default();
        let mut deps = deps();
        let mut outputs = Outputs::new();
        let mut ctx = UnitContext {
            unit: &unit,
            nodes: vec![
                node("k3s-server", 0, "10.0.0.11"),
                node("loadbalancer", 0, "10.0.0.10"),
            ],
            deps: &mut deps,
            outputs: &mut outputs,
            remote: &remote,
            secrets: &secrets,
        };
        HaproxyHandler.handle(&mut ctx).await.unwrap();

        let hosts: Vec<_> = remote.calls().into_iter().map(|(h, _)| h).collect();
        assert_eq!(hosts, vec!["10.0.0.10"]);
    }

    #[tokio::test]
    async fn test_rejects_bad_extra_ports() {
        let unit = action(json!({ "extraPorts": { "ingress": "http" } }));
        let remote = RecordingRemote::default();
        let secrets = Secrets::default();
        let mut deps = deps();
        let mut outputs = Outputs::new();
        let mut ctx = UnitContext {
            unit: &unit,
            nodes: vec![node("loadbalancer", 0, "10.0.0.10")],
            deps: &mut deps,
            outputs: &mut outputs,
            remote: &remote,
            secrets: &secrets,
        };
        let err = HaproxyHandler.handle(&mut ctx).await.unwrap_err();
        assert!(matches!(err, HandlerError::Config(_)));
        assert!(remote.calls().is_empty());
    }
}
