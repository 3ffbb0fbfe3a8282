//! Upstream Kubernetes with kubeadm.

use async_trait::async_trait;
use tracing::info;

use super::{UnitContext, UnitHandler};
use crate::deps::DepValue;
use crate::error::HandlerError;
use crate::executor::WorkUnit;
use crate::scripts;

const DEFAULT_POD_CIDR: &str = "10.244.0.0/16";
const DEFAULT_SERVICE_CIDR: &str = "10.96.0.0/12";

/// Dependency key holding the join command, prefixed with the role when
/// run as an action.
pub const JOIN_COMMAND_KEY: &str = "kubeadm-join-command";

/// Bootstraps a kubeadm cluster over the service's control plane and
/// worker groups.
///
/// Settings: `pod-cidr` and `service-cidr`. Publishes
/// [`JOIN_COMMAND_KEY`].
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeadmHandler;

#[async_trait]
impl UnitHandler for KubeadmHandler {
    async fn handle(&self, ctx: &mut UnitContext<'_>) -> Result<(), HandlerError> {
        let (control_groups, worker_groups) = match ctx.unit.service() {
            Some(spec) => (spec.control_plane.clone(), spec.workers.clone()),
            None => (ctx.unit.node_groups.clone(), Vec::new()),
        };
        if control_groups.is_empty() {
            return Err(HandlerError::Config(
                "kubeadm needs at least one control-plane group".into(),
            ));
        }
        let control_plane = ctx.hosts_in(&control_groups)?;
        let workers = if worker_groups.is_empty() {
            Vec::new()
        } else {
            ctx.hosts_in(&worker_groups)?
        };
        let (first, joiners) = control_plane
            .split_first()
            .ok_or_else(|| HandlerError::NoNodes(ctx.unit.id.clone()))?;

        let pod_cidr = ctx.config_str("pod-cidr", DEFAULT_POD_CIDR);
        let service_cidr = ctx.config_str("service-cidr", DEFAULT_SERVICE_CIDR);
        ctx.run(
            first,
            "kubeadm-init",
            &scripts::kubeadm_init(&first.address, &pod_cidr, &service_cidr),
        )
        .await?;
        let join_command = ctx
            .run(first, "read-join-command", &scripts::kubeadm_join_command())
            .await?;
        if !join_command.starts_with("kubeadm join") {
            return Err(HandlerError::Config(format!(
                "unexpected join command from {}: '{join_command}'",
                first.address
            )));
        }
        let key = ctx.unit.scoped_key(JOIN_COMMAND_KEY);
        ctx.publish(key.clone(), DepValue::Str(join_command))?;

        for (hosts, control) in [(joiners, true), (workers.as_slice(), false)] {
            for host in hosts {
                let command = ctx
                    .deps
                    .get_str(&key, ctx.requester())?
                    .to_string();
                let step = if control {
                    "kubeadm-join-control-plane"
                } else {
                    "kubeadm-join-worker"
                };
                ctx.run(host, step, &scripts::kubeadm_join(&command, control))
                    .await?;
            }
        }

        info!(
            unit = %ctx.unit.id,
            control_plane = control_plane.len(),
            workers = workers.len(),
            pod_cidr = %pod_cidr,
            service_cidr = %service_cidr,
            "kubeadm cluster bootstrapped"
        );
        Ok(())
    }

    fn publishes(&self, unit: &WorkUnit) -> Vec<String> {
        vec![unit.scoped_key(JOIN_COMMAND_KEY)]
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::ServiceSpec;
    use crate::deps::DependencyMap;
    use crate::executor::{UnitScope, WorkUnit};
    use crate::handlers::testing::{node, RecordingRemote};
    use crate::handlers::{Outputs, Secrets};

    const JOIN: &str = "kubeadm join 10.0.0.31:6443 --token abc.def --discovery-token-ca-cert-hash sha256:00";

    fn service(config: serde_json::Value) -> WorkUnit {
        let spec = ServiceSpec {
            enabled: true,
            control_plane: vec!["cp".into()],
            workers: vec!["worker".into()],
            config: config.as_object().cloned().unwrap_or_default(),
            ..ServiceSpec::default()
        };
        WorkUnit {
            id: "kubeadm".into(),
            unit_type: "kubeadm".into(),
            role: "kubeadm".into(),
            depends_on: vec![],
            config: spec.config.clone(),
            node_groups: spec.node_groups(),
            scope: UnitScope::Service(spec),
        }
    }

    #[tokio::test]
    async fn test_init_then_join_control_plane_and_workers() {
        let unit = service(json!({ "pod-cidr": "10.10.0.0/16" }));
        let remote = RecordingRemote::default().respond("cat /tmp/kubeadm-join-command.txt", JOIN);
        let secrets = Secrets::default();
        let mut deps = DependencyMap::new();
        let mut outputs = Outputs::new();
        let mut ctx = UnitContext {
            unit: &unit,
            nodes: vec![
                node("cp", 0, "10.0.0.31"),
                node("cp", 1, "10.0.0.32"),
                node("worker", 0, "10.0.0.41"),
            ],
            deps: &mut deps,
            outputs: &mut outputs,
            remote: &remote,
            secrets: &secrets,
        };
        KubeadmHandler.handle(&mut ctx).await.unwrap();

        let calls = remote.calls();
        let hosts: Vec<_> = calls.iter().map(|(h, _)| h.as_str()).collect();
        assert_eq!(hosts, vec!["10.0.0.31", "10.0.0.31", "10.0.0.32", "10.0.0.41"]);
        assert!(calls[0].1.contains("--pod-network-cidr=10.10.0.0/16"));
        assert!(calls[0].1.contains("--service-cidr=10.96.0.0/12"));
        assert!(calls[2].1.contains(&format!("sudo {JOIN} --control-plane")));
        assert!(calls[3].1.contains(&format!("sudo {JOIN}\n")));
        assert_eq!(deps.get_str(JOIN_COMMAND_KEY, "test").unwrap(), JOIN);
    }

    #[tokio::test]
    async fn test_requires_control_plane() {
        let spec = ServiceSpec {
            enabled: true,
            workers: vec!["worker".into()],
            ..ServiceSpec::default()
        };
        let unit = WorkUnit {
            id: "kubeadm".into(),
            unit_type: "kubeadm".into(),
            role: "kubeadm".into(),
            depends_on: vec![],
            config: serde_json::Map::new(),
            node_groups: spec.node_groups(),
            scope: UnitScope::Service(spec),
        };
        let remote = RecordingRemote::default();
        let secrets = Secrets::default();
        let mut deps = DependencyMap::new();
        let mut outputs = Outputs::new();
        let mut ctx = UnitContext {
            unit: &unit,
            nodes: vec![node("worker", 0, "10.0.0.41")],
            deps: &mut deps,
            outputs: &mut outputs,
            remote: &remote,
            secrets: &secrets,
        };
        let err = KubeadmHandler.handle(&mut ctx).await.unwrap_err();
        assert!(matches!(err, HandlerError::Config(_)));
        assert!(remote.calls().is_empty());
    }
}
