//! End-to-end run: create VMs, group them, then execute every unit.

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::info;

use crate::config::ClusterConfig;
use crate::creator::{create_fleet, plan_requests, RetryPolicy};
use crate::deps::DependencyMap;
use crate::executor::{ExecutionPlan, ExecutionReport, Executor};
use crate::grouping::{group_nodes, Addressing, Groups};
use crate::handlers::{HandlerRegistry, Outputs, Secrets};
use crate::providers::{Hypervisor, VmRequest};
use crate::remote::RemoteExecutor;

/// A description checked end to end, ready to apply.
#[derive(Debug)]
pub struct Prepared {
    pub config: ClusterConfig,
    pub plan: ExecutionPlan,
    pub requests: Vec<VmRequest>,
    pub policy: RetryPolicy,
}

/// Result of a successful run.
#[derive(Debug)]
pub struct RunSummary {
    /// Named outputs, handler exports included.
    pub outputs: Outputs,
    /// Executed units in order.
    pub report: ExecutionReport,
}

impl RunSummary {
    /// Output `name` as a string.
    #[must_use]
    pub fn output_str(&self, name: &str) -> Option<&str> {
        self.outputs.get(name).and_then(Value::as_str)
    }

    /// The `kubeconfig` service output, else the first `<role>-kubeconfig`
    /// exported by an action.
    #[must_use]
    pub fn kubeconfig(&self) -> Option<&str> {
        self.output_str("kubeconfig").or_else(|| {
            self.outputs
                .iter()
                .filter(|(name, _)| name.ends_with("-kubeconfig"))
                .find_map(|(_, value)| value.as_str())
        })
    }
}

/// Validate `config` and build everything a run needs, without side effects.
///
/// # Errors
/// Returns the first configuration problem found.
pub fn prepare(
    config: ClusterConfig,
    registry: &HandlerRegistry,
    ssh_public_key: Option<&str>,
) -> Result<Prepared> {
    config.validate().context("Invalid cluster description")?;
    let plan = ExecutionPlan::from_config(&config, registry)
        .context("Invalid actions or services")?;
    plan.order().context("Units can never all run")?;
    let requests =
        plan_requests(&config, ssh_public_key).context("Failed to plan VM creation")?;
    let policy = RetryPolicy::from(&config.vm_creation);
    Ok(Prepared {
        config,
        plan,
        requests,
        policy,
    })
}

/// Create every VM and execute every unit of `prepared`.
///
/// # Errors
/// Stops at the first failure. Nothing already created is rolled back.
pub async fn apply(
    prepared: &Prepared,
    hypervisor: &dyn Hypervisor,
    registry: &HandlerRegistry,
    remote: &dyn RemoteExecutor,
    secrets: &Secrets,
) -> Result<RunSummary> {
    info!(vms = prepared.requests.len(), units = prepared.plan.units().len(), "Starting run");

    let created = create_fleet(hypervisor, &prepared.requests, &prepared.policy)
        .await
        .context("VM creation failed")?;
    let groups = group_nodes(&created, &prepared.config.vms).context("Failed to group VMs")?;
    let mut deps = DependencyMap::build(&groups);

    let mut outputs = group_outputs(&groups, created.len());
    let report = Executor::new(registry, remote, secrets)
        .execute(&prepared.plan, &mut deps, &mut outputs)
        .await
        .context("Unit execution failed")?;

    info!(
        vms = created.len(),
        units = report.records.len(),
        outputs = outputs.len(),
        "Run complete"
    );
    Ok(RunSummary { outputs, report })
}

/// `totalVMsCreated` plus `<role>-count` and `<role>-ips` for every role.
fn group_outputs(groups: &Groups, total: usize) -> Outputs {
    let mut outputs = Outputs::new();
    outputs.insert("totalVMsCreated".into(), Value::from(total));
    for (role, group) in groups {
        outputs.insert(format!("{role}-count"), Value::from(group.len()));
        let ips = match group.addressing {
            Addressing::Static => Value::from(group.ips.clone()),
            Addressing::Dynamic => Value::from("dhcp"),
        };
        outputs.insert(format!("{role}-ips"), ips);
    }
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::NodeGroup;
    use crate::providers::VmHandle;

    #[test]
    fn test_group_outputs() {
        let mut groups = Groups::new();
        groups.insert(
            "lb".into(),
            NodeGroup {
                vms: vec![VmHandle {
                    vmid: 100,
                    name: "lb-0".into(),
                    node: "proxmox-1".into(),
                }],
                ips: vec!["10.0.0.10".into()],
                addressing: Addressing::Static,
            },
        );
        groups.insert(
            "harvester".into(),
            NodeGroup {
                vms: vec![],
                ips: vec![],
                addressing: Addressing::Dynamic,
            },
        );
        let outputs = group_outputs(&groups, 1);
        assert_eq!(outputs["totalVMsCreated"], Value::from(1));
        assert_eq!(outputs["lb-count"], Value::from(1));
        assert_eq!(outputs["lb-ips"], serde_json::json!(["10.0.0.10"]));
        assert_eq!(outputs["harvester-ips"], Value::from("dhcp"));
    }

    #[test]
    fn test_kubeconfig_prefers_service_output() {
        let mut summary = RunSummary {
            outputs: Outputs::new(),
            report: ExecutionReport::default(),
        };
        assert_eq!(summary.kubeconfig(), None);

        summary
            .outputs
            .insert("prod-kubeconfig".into(), Value::from("prod"));
        summary.outputs.insert("prod-count".into(), Value::from(3));
        assert_eq!(summary.kubeconfig(), Some("prod"));

        summary.outputs.insert("kubeconfig".into(), Value::from("svc"));
        assert_eq!(summary.kubeconfig(), Some("svc"));
    }

    #[test]
    fn test_prepare_rejects_unknown_unit_type_before_planning() {
        let yaml = r"
gateway: 10.0.0.1
vms:
  - name: lb
    templateId: 9000
    memory: 1024
    cpu: 1
    diskSize: 10
    ips: [10.0.0.10]
    actions:
      - type: install-talos
";
        let config = ClusterConfig::from_yaml(yaml).unwrap();
        let err = prepare(config, &HandlerRegistry::with_defaults(), Some("ssh-ed25519 AAAA"))
            .unwrap_err();
        assert!(format!("{err:#}").contains("install-talos"));
    }
}
