//! Dependency-ordered execution of actions and services.
//!
//! Every action declared on a node group and every enabled service becomes
//! a [`WorkUnit`]. [`ExecutionPlan::new`] resolves each `dependsOn` entry
//! before anything runs:
//!
//! - a unit id (explicit `id`, the synthesized `<role>-<type>`, or a service
//!   name) depends on exactly that unit;
//! - a role, or the name of a group carrying that role, depends on every
//!   unit declared for the role, and is satisfied immediately when the role
//!   declares none;
//! - anything else is a configuration error.
//!
//! Units then run one at a time in topological order. Ready units are
//! taken first-in first-out, seeded in declaration order, so independent
//! units keep the order they were written in.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use crate::config::{AuthMethod, BootMethod, ClusterConfig, IpxeConfig, ServiceSpec};
use crate::deps::{vms_key, DependencyMap};
use crate::error::{ConfigError, ExecuteError, HandlerError, StuckUnit};
use crate::handlers::{HandlerRegistry, Node, Outputs, Secrets, UnitContext};
use crate::remote::{RemoteExecutor, RemoteHost};

/// Where a unit was declared.
#[derive(Debug, Clone)]
pub enum UnitScope {
    /// Action on a node group.
    Action {
        boot_method: BootMethod,
        ipxe: Option<IpxeConfig>,
    },
    /// Cluster-wide service.
    Service(ServiceSpec),
}

/// One action or service to execute.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    /// Unique id.
    pub id: String,
    /// Handler type.
    pub unit_type: String,
    /// Owning role, or the service name.
    pub role: String,
    /// Declared dependencies (unit ids or roles).
    pub depends_on: Vec<String>,
    /// Handler settings.
    pub config: Map<String, Value>,
    /// Roles whose nodes the unit runs on.
    pub node_groups: Vec<String>,
    /// Declaration site.
    pub scope: UnitScope,
}

impl WorkUnit {
    /// The service settings, when declared as a service.
    #[must_use]
    pub fn service(&self) -> Option<&ServiceSpec> {
        match &self.scope {
            UnitScope::Service(spec) => Some(spec),
            UnitScope::Action { .. } => None,
        }
    }

    /// Dependency and output key for `name` as published by this unit.
    ///
    /// Services publish `name` as is; actions prefix their role, so groups
    /// running the same action type stay apart.
    #[must_use]
    pub fn scoped_key(&self, name: &str) -> String {
        match self.scope {
            UnitScope::Service(_) => name.to_string(),
            UnitScope::Action { .. } => format!("{}-{name}", self.role),
        }
    }
}

/// Units declared by `config`: group actions in order, then enabled services.
#[must_use]
pub fn collect_units(config: &ClusterConfig) -> Vec<WorkUnit> {
    let mut units = Vec::new();
    for group in &config.vms {
        let role = group.role();
        for action in &group.actions {
            units.push(WorkUnit {
                id: action
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("{role}-{}", action.unit_type)),
                unit_type: action.unit_type.clone(),
                role: role.to_string(),
                depends_on: action.depends_on.clone(),
                config: action.config.clone(),
                node_groups: vec![role.to_string()],
                scope: UnitScope::Action {
                    boot_method: group.boot_method,
                    ipxe: group.ipxe_config.clone(),
                },
            });
        }
    }
    for (name, spec) in config.services.enabled() {
        units.push(WorkUnit {
            id: name.to_string(),
            unit_type: name.to_string(),
            role: name.to_string(),
            depends_on: spec.depends_on.clone(),
            config: spec.config.clone(),
            node_groups: spec.node_groups(),
            scope: UnitScope::Service(spec.clone()),
        });
    }
    units
}

/// How nodes of one role are logged into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub user: String,
    pub auth: AuthMethod,
}

/// Roles known to a description, with their logins and the group names
/// that refer to them.
#[derive(Debug, Clone, Default)]
pub struct Roles {
    logins: BTreeMap<String, Login>,
    aliases: BTreeMap<String, String>,
}

impl Roles {
    /// Roles of every group in `config`. Groups whose name differs from
    /// their role can be referenced by either.
    #[must_use]
    pub fn from_config(config: &ClusterConfig) -> Self {
        let mut roles = Self::default();
        for group in &config.vms {
            let role = group.role();
            let user = config
                .ssh_user
                .clone()
                .or_else(|| group.username.clone())
                .unwrap_or_default();
            roles.insert(
                role,
                Login {
                    user,
                    auth: group.auth_method,
                },
            );
            if group.name != role {
                roles.alias(&group.name, role);
            }
        }
        roles
    }

    /// Add `role`; the first login registered for a role wins.
    pub fn insert(&mut self, role: impl Into<String>, login: Login) -> &mut Self {
        self.logins.entry(role.into()).or_insert(login);
        self
    }

    /// Let `name` stand for `role`.
    pub fn alias(&mut self, name: impl Into<String>, role: impl Into<String>) -> &mut Self {
        self.aliases.entry(name.into()).or_insert_with(|| role.into());
        self
    }

    /// Role named by `name`, either directly or through a group name.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<&str> {
        if let Some((role, _)) = self.logins.get_key_value(name) {
            return Some(role.as_str());
        }
        self.aliases
            .get(name)
            .filter(|role| self.logins.contains_key(*role))
            .map(String::as_str)
    }

    /// Login for nodes of `role`.
    #[must_use]
    pub fn login(&self, role: &str) -> Option<&Login> {
        self.logins.get(role)
    }
}

/// Validated units with resolved dependencies.
#[derive(Debug)]
pub struct ExecutionPlan {
    units: Vec<WorkUnit>,
    /// Resolved dependencies per unit, deduplicated.
    requires: Vec<Vec<usize>>,
    /// Reverse edges of `requires`.
    dependents: Vec<Vec<usize>>,
    roles: Roles,
}

impl ExecutionPlan {
    /// Build the plan for a whole description.
    ///
    /// # Errors
    /// See [`ExecutionPlan::new`].
    pub fn from_config(
        config: &ClusterConfig,
        registry: &HandlerRegistry,
    ) -> Result<Self, ConfigError> {
        Self::new(collect_units(config), Roles::from_config(config), registry)
    }

    /// Validate `units` against the registry and the known roles and
    /// resolve their dependencies.
    ///
    /// Group names in node groups and service settings are rewritten to
    /// their role.
    ///
    /// # Errors
    /// Fails on duplicate ids, unregistered types, references to unknown
    /// groups, dependencies that name neither a unit nor a group, and two
    /// units publishing the same dependency key.
    pub fn new(
        mut units: Vec<WorkUnit>,
        roles: Roles,
        registry: &HandlerRegistry,
    ) -> Result<Self, ConfigError> {
        for unit in &mut units {
            unit.node_groups = canonical_groups(&roles, &unit.id, &unit.node_groups)?;
            if let UnitScope::Service(spec) = &mut unit.scope {
                for groups in [
                    &mut spec.targets,
                    &mut spec.control_plane,
                    &mut spec.workers,
                    &mut spec.loadbalancer,
                ] {
                    *groups = canonical_groups(&roles, &unit.id, groups)?;
                }
                if let Some(backend) = &mut spec.backend_discovery {
                    if let Some(role) = roles.resolve(backend) {
                        *backend = role.to_string();
                    }
                }
            }
        }

        let mut by_id: HashMap<&str, usize> = HashMap::new();
        let mut by_role: HashMap<&str, Vec<usize>> = HashMap::new();
        let mut publishers: HashMap<String, &str> = HashMap::new();
        for (idx, unit) in units.iter().enumerate() {
            if by_id.insert(&unit.id, idx).is_some() {
                return Err(ConfigError::DuplicateUnit(unit.id.clone()));
            }
            let handler = registry
                .get(&unit.unit_type)
                .ok_or_else(|| ConfigError::UnknownUnitType {
                    unit: unit.id.clone(),
                    unit_type: unit.unit_type.clone(),
                })?;
            for key in handler.publishes(unit) {
                if let Some(first) = publishers.insert(key.clone(), &unit.id) {
                    return Err(ConfigError::ConflictingKey {
                        key,
                        first: first.to_string(),
                        second: unit.id.clone(),
                    });
                }
            }
            by_role.entry(&unit.role).or_default().push(idx);
        }

        let mut requires = Vec::with_capacity(units.len());
        for unit in &units {
            let mut resolved = BTreeSet::new();
            for dep in &unit.depends_on {
                if let Some(&idx) = by_id.get(dep.as_str()) {
                    resolved.insert(idx);
                } else if let Some(role) = roles.resolve(dep) {
                    if let Some(members) = by_role.get(role) {
                        resolved.extend(members.iter().copied());
                    }
                } else if let Some(members) = by_role.get(dep.as_str()) {
                    resolved.extend(members.iter().copied());
                } else {
                    return Err(ConfigError::UnknownDependency {
                        unit: unit.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            requires.push(resolved.into_iter().collect::<Vec<_>>());
        }

        let mut dependents = vec![Vec::new(); units.len()];
        for (idx, deps) in requires.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(idx);
            }
        }

        Ok(Self {
            units,
            requires,
            dependents,
            roles,
        })
    }

    /// Units in declaration order.
    #[must_use]
    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    /// Execution order, without running anything.
    ///
    /// # Errors
    /// Returns `ExecuteError::Deadlock` if some units can never run.
    pub fn order(&self) -> Result<Vec<&WorkUnit>, ExecuteError> {
        let mut scheduler = Scheduler::new(self);
        let mut order = Vec::with_capacity(self.units.len());
        while let Some(idx) = scheduler.next()? {
            order.push(&self.units[idx]);
            scheduler.complete(idx);
        }
        Ok(order)
    }

    fn stuck(&self, done: &[bool]) -> Vec<StuckUnit> {
        self.units
            .iter()
            .enumerate()
            .filter(|(idx, _)| !done[*idx])
            .map(|(_, unit)| {
                let unmet = unit
                    .depends_on
                    .iter()
                    .filter(|dep| {
                        let role = self.roles.resolve(dep).unwrap_or(dep.as_str());
                        self.units
                            .iter()
                            .enumerate()
                            .any(|(i, u)| !done[i] && (u.id == **dep || u.role == role))
                    })
                    .cloned()
                    .collect();
                StuckUnit {
                    unit: unit.id.clone(),
                    unmet,
                }
            })
            .collect()
    }
}

/// Kahn's algorithm over an [`ExecutionPlan`].
struct Scheduler<'p> {
    plan: &'p ExecutionPlan,
    waiting_on: Vec<usize>,
    ready: VecDeque<usize>,
    done: Vec<bool>,
    finished: usize,
}

impl<'p> Scheduler<'p> {
    fn new(plan: &'p ExecutionPlan) -> Self {
        let waiting_on: Vec<usize> = plan.requires.iter().map(Vec::len).collect();
        let ready = waiting_on
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(idx, _)| idx)
            .collect();
        Self {
            plan,
            waiting_on,
            ready,
            done: vec![false; plan.units.len()],
            finished: 0,
        }
    }

    /// Next runnable unit, `None` once everything ran.
    fn next(&mut self) -> Result<Option<usize>, ExecuteError> {
        if let Some(idx) = self.ready.pop_front() {
            return Ok(Some(idx));
        }
        if self.finished == self.plan.units.len() {
            return Ok(None);
        }
        Err(ExecuteError::Deadlock {
            pending: self.plan.stuck(&self.done),
        })
    }

    fn complete(&mut self, idx: usize) {
        self.done[idx] = true;
        self.finished += 1;
        for &dependent in &self.plan.dependents[idx] {
            self.waiting_on[dependent] -= 1;
            if self.waiting_on[dependent] == 0 {
                self.ready.push_back(dependent);
            }
        }
    }
}

/// One executed unit.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    /// Position in execution order, starting at 1.
    pub seq: usize,
    pub unit: String,
    pub unit_type: String,
    pub role: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    /// Executed units in order.
    pub records: Vec<ExecutionRecord>,
    /// Unit ids and fully completed roles.
    pub completed: BTreeSet<String>,
}

impl ExecutionReport {
    /// Record for `unit`.
    #[must_use]
    pub fn record(&self, unit: &str) -> Option<&ExecutionRecord> {
        self.records.iter().find(|r| r.unit == unit)
    }
}

/// Runs a plan's units through their handlers.
pub struct Executor<'a> {
    registry: &'a HandlerRegistry,
    remote: &'a dyn RemoteExecutor,
    secrets: &'a Secrets,
}

impl<'a> Executor<'a> {
    #[must_use]
    pub fn new(
        registry: &'a HandlerRegistry,
        remote: &'a dyn RemoteExecutor,
        secrets: &'a Secrets,
    ) -> Self {
        Self {
            registry,
            remote,
            secrets,
        }
    }

    /// Execute every unit of `plan` once, in dependency order.
    ///
    /// # Errors
    /// Stops at the first handler failure, or with `ExecuteError::Deadlock`
    /// when the remaining units can never run. Work done by earlier units
    /// is not rolled back.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        deps: &mut DependencyMap,
        outputs: &mut Outputs,
    ) -> Result<ExecutionReport, ExecuteError> {
        let mut scheduler = Scheduler::new(plan);
        let mut report = ExecutionReport::default();
        let mut role_remaining: HashMap<&str, usize> = HashMap::new();
        for unit in &plan.units {
            *role_remaining.entry(&unit.role).or_default() += 1;
        }

        while let Some(idx) = scheduler.next()? {
            let unit = &plan.units[idx];
            let handler = self
                .registry
                .get(&unit.unit_type)
                .ok_or_else(|| ExecuteError::Unregistered(unit.unit_type.clone()))?;
            let wrap = |source| ExecuteError::Handler {
                unit: unit.id.clone(),
                unit_type: unit.unit_type.clone(),
                role: unit.role.clone(),
                source,
            };

            let nodes = resolve_nodes(unit, deps, &plan.roles).map_err(wrap)?;
            if nodes.is_empty() && unit.service().is_some() {
                return Err(wrap(HandlerError::NoNodes(unit.id.clone())));
            }
            info!(
                unit = %unit.id,
                unit_type = %unit.unit_type,
                role = %unit.role,
                nodes = nodes.len(),
                "Executing unit"
            );

            let started_at = Utc::now();
            let mut ctx = UnitContext {
                unit,
                nodes,
                deps: &mut *deps,
                outputs: &mut *outputs,
                remote: self.remote,
                secrets: self.secrets,
            };
            if let Err(source) = handler.handle(&mut ctx).await {
                error!(unit = %unit.id, error = %source, "Unit failed");
                return Err(wrap(source));
            }

            scheduler.complete(idx);
            report.completed.insert(unit.id.clone());
            if let Some(left) = role_remaining.get_mut(unit.role.as_str()) {
                *left -= 1;
                if *left == 0 {
                    report.completed.insert(unit.role.clone());
                }
            }
            report.records.push(ExecutionRecord {
                seq: report.records.len() + 1,
                unit: unit.id.clone(),
                unit_type: unit.unit_type.clone(),
                role: unit.role.clone(),
                started_at,
                finished_at: Utc::now(),
            });
            debug!(unit = %unit.id, "Unit complete");
        }

        info!(units = report.records.len(), "All units executed");
        Ok(report)
    }
}

/// Role names for `groups`, deduplicated in order.
fn canonical_groups(
    roles: &Roles,
    unit: &str,
    groups: &[String],
) -> Result<Vec<String>, ConfigError> {
    let mut resolved: Vec<String> = Vec::with_capacity(groups.len());
    for group in groups {
        let role = roles.resolve(group).ok_or_else(|| ConfigError::Invalid {
            context: format!("unit '{unit}'"),
            reason: format!("no node group has role or name '{group}'"),
        })?;
        if !resolved.iter().any(|r| r == role) {
            resolved.push(role.to_string());
        }
    }
    Ok(resolved)
}

/// Nodes of the unit's groups, read back from the dependency map.
fn resolve_nodes(
    unit: &WorkUnit,
    deps: &DependencyMap,
    roles: &Roles,
) -> Result<Vec<Node>, HandlerError> {
    let mut nodes = Vec::new();
    for group in &unit.node_groups {
        let vms = deps.get_handles(&vms_key(group), &unit.id)?;
        let ips = deps.addresses(group, &unit.id)?;
        let login = roles.login(group);
        for (index, vm) in vms.iter().enumerate() {
            let host = ips.and_then(|ips| ips.get(index)).map(|ip| {
                let user = login.map(|l| l.user.clone()).unwrap_or_default();
                let auth = login.map(|l| l.auth).unwrap_or_default();
                RemoteHost::new(ip.clone(), user).with_auth(auth)
            });
            nodes.push(Node {
                group: group.clone(),
                vm: vm.clone(),
                host,
            });
        }
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::deps::DepValue;
    use crate::grouping::{Addressing, Groups, NodeGroup};
    use crate::handlers::testing::RecordingRemote;
    use crate::handlers::UnitHandler;
    use crate::providers::VmHandle;

    /// Records execution order and fails for one unit id.
    #[derive(Clone, Default)]
    struct Recorder {
        order: Arc<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl UnitHandler for Recorder {
        async fn handle(&self, ctx: &mut UnitContext<'_>) -> Result<(), HandlerError> {
            if self.fail_on == Some(ctx.unit.id.as_str()) {
                return Err(HandlerError::Config("boom".into()));
            }
            self.order.lock().unwrap().push(ctx.unit.id.clone());
            Ok(())
        }
    }

    fn registry(recorder: &Recorder) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register("noop", recorder.clone());
        registry
    }

    fn unit(id: &str, role: &str, depends_on: &[&str]) -> WorkUnit {
        WorkUnit {
            id: id.to_string(),
            unit_type: "noop".into(),
            role: role.to_string(),
            depends_on: depends_on.iter().map(ToString::to_string).collect(),
            config: Map::new(),
            node_groups: vec![role.to_string()],
            scope: UnitScope::Action {
                boot_method: BootMethod::CloudInit,
                ipxe: None,
            },
        }
    }

    fn roles(names: &[&str]) -> Roles {
        let mut roles = Roles::default();
        for name in names {
            roles.insert(
                *name,
                Login {
                    user: "ops".into(),
                    auth: AuthMethod::SshKey,
                },
            );
        }
        roles
    }

    fn deps_for(names: &[&str]) -> DependencyMap {
        let mut groups = Groups::new();
        for (i, name) in names.iter().enumerate() {
            groups.insert(
                (*name).to_string(),
                NodeGroup {
                    vms: vec![VmHandle {
                        vmid: 100 + u32::try_from(i).unwrap(),
                        name: format!("{name}-0"),
                        node: "proxmox-1".into(),
                    }],
                    ips: vec![format!("10.0.0.{}", 10 + i)],
                    addressing: Addressing::Static,
                },
            );
        }
        DependencyMap::build(&groups)
    }

    async fn run(
        units: Vec<WorkUnit>,
        role_names: &[&str],
        recorder: &Recorder,
    ) -> Result<ExecutionReport, ExecuteError> {
        let registry = registry(recorder);
        let plan = ExecutionPlan::new(units, roles(role_names), &registry).unwrap();
        let remote = RecordingRemote::default();
        let secrets = Secrets::default();
        let mut deps = deps_for(role_names);
        let mut outputs = Outputs::new();
        Executor::new(&registry, &remote, &secrets)
            .execute(&plan, &mut deps, &mut outputs)
            .await
    }

    #[tokio::test]
    async fn test_role_dependency_waits_for_later_declared_units() {
        let recorder = Recorder::default();
        let units = vec![
            unit("k3s-server-install", "k3s-server", &["loadbalancer"]),
            unit("loadbalancer-a", "loadbalancer", &[]),
            unit("loadbalancer-b", "loadbalancer", &["loadbalancer-a"]),
        ];
        let report = run(units, &["k3s-server", "loadbalancer"], &recorder)
            .await
            .unwrap();

        assert_eq!(
            *recorder.order.lock().unwrap(),
            vec!["loadbalancer-a", "loadbalancer-b", "k3s-server-install"]
        );
        assert!(report.completed.contains("loadbalancer"));
        assert!(report.completed.contains("k3s-server"));
        let server = report.record("k3s-server-install").unwrap();
        for lb in ["loadbalancer-a", "loadbalancer-b"] {
            let record = report.record(lb).unwrap();
            assert!(record.seq < server.seq);
            assert!(record.finished_at <= server.started_at);
        }
    }

    #[tokio::test]
    async fn test_every_unit_runs_exactly_once() {
        let recorder = Recorder::default();
        let units = vec![
            unit("d", "web", &["b", "c"]),
            unit("b", "web", &["a"]),
            unit("c", "db", &["a"]),
            unit("a", "db", &[]),
            unit("e", "cache", &["web", "db"]),
        ];
        let report = run(units, &["web", "db", "cache", "empty"], &recorder)
            .await
            .unwrap();

        let order = recorder.order.lock().unwrap().clone();
        assert_eq!(order, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(report.records.len(), 5);
        let seqs: Vec<_> = report.records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_cycle_is_reported_as_deadlock() {
        let recorder = Recorder::default();
        let units = vec![
            unit("a", "web", &["b"]),
            unit("b", "web", &["a"]),
            unit("c", "db", &[]),
        ];
        let err = run(units, &["web", "db"], &recorder).await.unwrap_err();

        let ExecuteError::Deadlock { pending } = err else {
            panic!("expected deadlock, got {err}");
        };
        assert_eq!(
            pending,
            vec![
                StuckUnit {
                    unit: "a".into(),
                    unmet: vec!["b".into()]
                },
                StuckUnit {
                    unit: "b".into(),
                    unmet: vec!["a".into()]
                },
            ]
        );
        assert_eq!(*recorder.order.lock().unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_dependency_on_empty_role_is_satisfied() {
        let recorder = Recorder::default();
        let units = vec![unit("a", "web", &["spare"])];
        run(units, &["web", "spare"], &recorder).await.unwrap();
        assert_eq!(*recorder.order.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_handler_failure_names_unit_and_stops() {
        let recorder = Recorder {
            fail_on: Some("b"),
            ..Recorder::default()
        };
        let units = vec![unit("a", "web", &[]), unit("b", "db", &["a"]), unit("c", "web", &["b"])];
        let err = run(units, &["web", "db"], &recorder).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to execute noop 'b' for db: Invalid unit config: boom"
        );
        assert_eq!(*recorder.order.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let registry = registry(&Recorder::default());
        let err = ExecutionPlan::new(vec![unit("a", "web", &["ghost"])], roles(&["web"]), &registry)
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDependency { ref dependency, .. } if dependency == "ghost"));
    }

    #[test]
    fn test_unknown_type_and_duplicates_are_rejected() {
        let registry = registry(&Recorder::default());
        let mut bad = unit("a", "web", &[]);
        bad.unit_type = "install-talos".into();
        let err = ExecutionPlan::new(vec![bad], roles(&["web"]), &registry).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownUnitType { .. }));

        let err = ExecutionPlan::new(
            vec![unit("a", "web", &[]), unit("a", "web", &[])],
            roles(&["web"]),
            &registry,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateUnit(ref id) if id == "a"));
    }

    #[test]
    fn test_collect_units_from_config() {
        let yaml = r"
gateway: 10.0.0.1
vms:
  - name: lb
    role: loadbalancer
    templateId: 9000
    memory: 1024
    cpu: 1
    diskSize: 10
    ips: [10.0.0.10]
    actions:
      - type: install-haproxy
        dependsOn: [k3s-server]
  - name: k3s-server
    templateId: 9000
    memory: 1024
    cpu: 1
    diskSize: 10
    ips: [10.0.0.11]
    actions:
      - id: servers
        type: install-k3s-server
services:
  harvester:
    enabled: true
    targets: [k3s-server]
    dependsOn: [servers]
";
        let config = ClusterConfig::from_yaml(yaml).unwrap();
        let plan = ExecutionPlan::from_config(&config, &HandlerRegistry::with_defaults()).unwrap();
        let ids: Vec<_> = plan.units().iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["loadbalancer-install-haproxy", "servers", "harvester"]);
        let order: Vec<_> = plan.order().unwrap().iter().map(|u| u.id.as_str()).collect();
        assert_eq!(order, vec!["servers", "loadbalancer-install-haproxy", "harvester"]);
    }

    #[test]
    fn test_order_detects_deadlock_without_running() {
        let registry = registry(&Recorder::default());
        let plan = ExecutionPlan::new(
            vec![unit("a", "web", &["a"])],
            roles(&["web"]),
            &registry,
        )
        .unwrap();
        assert!(matches!(plan.order(), Err(ExecuteError::Deadlock { .. })));
    }

    #[tokio::test]
    async fn test_units_see_values_published_by_dependencies() {
        struct Writer;
        struct Reader(Arc<Mutex<Option<String>>>);

        #[async_trait]
        impl UnitHandler for Writer {
            async fn handle(&self, ctx: &mut UnitContext<'_>) -> Result<(), HandlerError> {
                ctx.publish("token", DepValue::Str("s3cr3t".into()))
            }
        }

        #[async_trait]
        impl UnitHandler for Reader {
            async fn handle(&self, ctx: &mut UnitContext<'_>) -> Result<(), HandlerError> {
                let token = ctx.deps.get_str("token", ctx.requester())?.to_string();
                *self.0.lock().unwrap() = Some(token);
                Ok(())
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let mut registry = HandlerRegistry::new();
        registry
            .register("write", Writer)
            .register("read", Reader(Arc::clone(&seen)));
        let mut reader = unit("reader", "web", &["writer"]);
        reader.unit_type = "read".into();
        let mut writer = unit("writer", "web", &[]);
        writer.unit_type = "write".into();

        let plan = ExecutionPlan::new(vec![reader, writer], roles(&["web"]), &registry).unwrap();
        let remote = RecordingRemote::default();
        let secrets = Secrets::default();
        let mut deps = deps_for(&["web"]);
        let mut outputs = Outputs::new();
        Executor::new(&registry, &remote, &secrets)
            .execute(&plan, &mut deps, &mut outputs)
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().as_deref(), Some("s3cr3t"));
    }

    const TWO_CLUSTERS: &str = r"
gateway: 10.0.0.1
password: hunter2
vms:
  - name: lb
    role: loadbalancer
    templateId: 9000
    memory: 1024
    cpu: 1
    diskSize: 10
    ips: [10.0.0.10]
  - name: prod
    count: 2
    templateId: 9000
    memory: 4096
    cpu: 2
    diskSize: 40
    ips: [10.0.0.11, 10.0.0.12]
    actions:
      - type: install-k3s-server
        dependsOn: [lb]
  - name: staging
    templateId: 9000
    memory: 4096
    cpu: 2
    diskSize: 40
    authMethod: password
    username: admin
    ips: [10.0.0.21]
    actions:
      - type: install-k3s-server
        dependsOn: [lb]
";

    fn two_clusters_deps() -> DependencyMap {
        let mut groups = Groups::new();
        for (role, ips) in [
            ("loadbalancer", vec!["10.0.0.10"]),
            ("prod", vec!["10.0.0.11", "10.0.0.12"]),
            ("staging", vec!["10.0.0.21"]),
        ] {
            let vms = (0..ips.len())
                .map(|i| VmHandle {
                    vmid: 100 + u32::try_from(i).unwrap(),
                    name: format!("{role}-{i}"),
                    node: "proxmox-1".into(),
                })
                .collect();
            groups.insert(
                role.to_string(),
                NodeGroup {
                    vms,
                    ips: ips.into_iter().map(String::from).collect(),
                    addressing: Addressing::Static,
                },
            );
        }
        DependencyMap::build(&groups)
    }

    #[tokio::test]
    async fn test_independent_clusters_keep_their_own_tokens() {
        let config = ClusterConfig::from_yaml(TWO_CLUSTERS).unwrap();
        let registry = HandlerRegistry::with_defaults();
        let plan = ExecutionPlan::from_config(&config, &registry).unwrap();
        let remote = RecordingRemote::default().respond("node-token", "K10shared::server:token");
        let secrets = Secrets::default();
        let mut deps = two_clusters_deps();
        let mut outputs = Outputs::new();

        let report = Executor::new(&registry, &remote, &secrets)
            .execute(&plan, &mut deps, &mut outputs)
            .await
            .unwrap();

        assert_eq!(report.records.len(), 2);
        assert!(report.completed.contains("prod"));
        assert!(report.completed.contains("staging"));
        for role in ["prod", "staging"] {
            assert_eq!(
                deps.get_str(&format!("{role}-k3s-token"), "test").unwrap(),
                "K10shared::server:token"
            );
        }
        assert_eq!(
            deps.get_str("staging-k3s-first-server-ip", "test").unwrap(),
            "10.0.0.21"
        );
    }

    #[test]
    fn test_units_publishing_the_same_key_are_rejected() {
        let yaml = TWO_CLUSTERS.replace(
            "      - type: install-k3s-server\n        dependsOn: [lb]\n  - name: staging",
            "      - type: install-k3s-server\n        dependsOn: [lb]\n      - id: again\n        type: install-k3s-server\n  - name: staging",
        );
        let config = ClusterConfig::from_yaml(&yaml).unwrap();
        let err = ExecutionPlan::from_config(&config, &HandlerRegistry::with_defaults()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ConflictingKey { ref key, ref first, ref second }
                if key == "prod-k3s-token" && first == "prod-install-k3s-server" && second == "again"
        ));
    }

    #[test]
    fn test_group_names_resolve_to_their_role() {
        let yaml = format!(
            "{TWO_CLUSTERS}services:\n  haproxy:\n    enabled: true\n    targets: [lb]\n    loadbalancer: [lb]\n    backend-discovery: prod\n    dependsOn: [lb, prod]\n"
        );
        let config = ClusterConfig::from_yaml(&yaml).unwrap();
        let plan = ExecutionPlan::from_config(&config, &HandlerRegistry::with_defaults()).unwrap();

        let haproxy = plan.units().iter().find(|u| u.id == "haproxy").unwrap();
        assert_eq!(haproxy.node_groups, vec!["loadbalancer"]);
        assert_eq!(haproxy.service().unwrap().loadbalancer, vec!["loadbalancer"]);

        let order: Vec<_> = plan.order().unwrap().iter().map(|u| u.id.as_str()).collect();
        assert_eq!(
            order,
            vec!["prod-install-k3s-server", "staging-install-k3s-server", "haproxy"]
        );

        let mut missing = unit("a", "web", &[]);
        missing.node_groups = vec!["ghost".into()];
        let err = ExecutionPlan::new(vec![missing], roles(&["web"]), &HandlerRegistry::new())
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn test_nodes_carry_their_group_login() {
        struct Hosts(Arc<Mutex<Vec<RemoteHost>>>);

        #[async_trait]
        impl UnitHandler for Hosts {
            async fn handle(&self, ctx: &mut UnitContext<'_>) -> Result<(), HandlerError> {
                self.0.lock().unwrap().extend(ctx.hosts()?);
                Ok(())
            }
        }

        let config = ClusterConfig::from_yaml(TWO_CLUSTERS).unwrap();
        let roles = Roles::from_config(&config);
        assert_eq!(roles.resolve("lb"), Some("loadbalancer"));
        assert_eq!(roles.resolve("loadbalancer"), Some("loadbalancer"));
        assert_eq!(roles.resolve("ghost"), None);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register("noop", Hosts(Arc::clone(&seen)));
        let units = vec![unit("a", "prod", &[]), unit("b", "staging", &["a"])];
        let plan = ExecutionPlan::new(units, roles, &registry).unwrap();

        let remote = RecordingRemote::default();
        let secrets = Secrets::default();
        let mut deps = two_clusters_deps();
        let mut outputs = Outputs::new();
        Executor::new(&registry, &remote, &secrets)
            .execute(&plan, &mut deps, &mut outputs)
            .await
            .unwrap();

        let hosts = seen.lock().unwrap().clone();
        assert_eq!(hosts.len(), 3);
        assert!(hosts[..2].iter().all(|h| h.auth == AuthMethod::SshKey));
        assert_eq!(
            hosts[2],
            RemoteHost::new("10.0.0.21", "admin").with_auth(AuthMethod::Password)
        );
    }
}
