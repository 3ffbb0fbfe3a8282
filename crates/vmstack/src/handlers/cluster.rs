//! K3s and RKE2 server clusters.
//!
//! The first server initialises the cluster and publishes its join token.
//! Every other server reads the token back from the dependency map and
//! joins through the load balancer, so the token is fetched exactly once.

use async_trait::async_trait;
use tracing::info;

use super::{UnitContext, UnitHandler};
use crate::deps::DepValue;
use crate::error::HandlerError;
use crate::executor::WorkUnit;
use crate::remote::RemoteHost;
use crate::scripts::{self, Distribution};

/// Role fronting the API servers when none is configured.
const DEFAULT_LOADBALANCER: &str = "loadbalancer";

fn loadbalancer_role(ctx: &UnitContext<'_>) -> String {
    ctx.unit
        .service()
        .and_then(|spec| spec.loadbalancer.first().cloned())
        .unwrap_or_else(|| ctx.config_str("loadbalancer", DEFAULT_LOADBALANCER))
}

/// Installs a K3s or RKE2 server on every node of the unit.
///
/// Publishes `<dist>-token` and `<dist>-first-server-ip`, prefixed with the
/// role when run as an action. As a service it also fetches the kubeconfig,
/// published and exported as `kubeconfig` for K3s and `rke2-kubeconfig`
/// for RKE2.
#[derive(Debug, Clone, Copy)]
pub struct ClusterHandler {
    dist: Distribution,
}

impl ClusterHandler {
    #[must_use]
    pub fn new(dist: Distribution) -> Self {
        Self { dist }
    }

    fn servers(ctx: &UnitContext<'_>) -> Result<Vec<RemoteHost>, HandlerError> {
        match ctx.unit.service() {
            Some(spec) => {
                let groups: Vec<String> = spec
                    .node_groups()
                    .into_iter()
                    .filter(|g| !spec.loadbalancer.contains(g))
                    .collect();
                let hosts = ctx.hosts_in(&groups)?;
                if hosts.is_empty() {
                    return Err(HandlerError::NoNodes(ctx.unit.id.clone()));
                }
                Ok(hosts)
            }
            None => ctx.hosts(),
        }
    }

    fn kubeconfig_key(self) -> &'static str {
        match self.dist {
            Distribution::K3s => "kubeconfig",
            Distribution::Rke2 => "rke2-kubeconfig",
        }
    }

    fn token_key(self, unit: &WorkUnit) -> String {
        unit.scoped_key(&format!("{}-token", self.dist.name()))
    }

    fn first_server_key(self, unit: &WorkUnit) -> String {
        unit.scoped_key(&format!("{}-first-server-ip", self.dist.name()))
    }
}

#[async_trait]
impl UnitHandler for ClusterHandler {
    async fn handle(&self, ctx: &mut UnitContext<'_>) -> Result<(), HandlerError> {
        let dist = self.dist;
        let name = dist.name();
        let lb_role = loadbalancer_role(ctx);
        let lb_ip = ctx.deps.first_address(&lb_role, ctx.requester())?.to_string();
        let servers = Self::servers(ctx)?;
        let token_key = self.token_key(ctx.unit);

        let (first, joiners) = servers
            .split_first()
            .ok_or_else(|| HandlerError::NoNodes(ctx.unit.id.clone()))?;

        ctx.run(first, "server-init", &scripts::server_init(dist, &lb_ip))
            .await?;
        let token = ctx.run(first, "read-token", &scripts::read_token(dist)).await?;
        if token.is_empty() {
            return Err(HandlerError::Config(format!(
                "{name} server {} returned an empty join token",
                first.address
            )));
        }
        ctx.publish(token_key.clone(), DepValue::Str(token))?;
        ctx.publish(
            self.first_server_key(ctx.unit),
            DepValue::Str(first.address.clone()),
        )?;

        for host in joiners {
            let token = ctx.deps.get_str(&token_key, ctx.requester())?.to_string();
            ctx.run(host, "server-join", &scripts::server_join(dist, &lb_ip, &token))
                .await?;
        }

        info!(
            unit = %ctx.unit.id,
            distribution = name,
            servers = servers.len(),
            loadbalancer = %lb_ip,
            "Cluster servers installed"
        );

        if ctx.unit.service().is_some() {
            let kubeconfig = ctx
                .run(first, "read-kubeconfig", &scripts::read_kubeconfig(dist, &lb_ip))
                .await?;
            let key = ctx.unit.scoped_key(self.kubeconfig_key());
            ctx.publish(key.clone(), DepValue::Str(kubeconfig.clone()))?;
            ctx.export(key, kubeconfig);
        }
        Ok(())
    }

    fn publishes(&self, unit: &WorkUnit) -> Vec<String> {
        let mut keys = vec![self.token_key(unit), self.first_server_key(unit)];
        if unit.service().is_some() {
            keys.push(unit.scoped_key(self.kubeconfig_key()));
        }
        keys
    }
}

/// Fetches the admin kubeconfig from the first node of the unit.
///
/// Settings: `distribution` (`k3s` or `rke2`) and `loadbalancer` (a role).
/// Publishes and exports `<role>-kubeconfig`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeconfigHandler;

#[async_trait]
impl UnitHandler for KubeconfigHandler {
    async fn handle(&self, ctx: &mut UnitContext<'_>) -> Result<(), HandlerError> {
        let dist = ctx.distribution()?;
        let lb_role = loadbalancer_role(ctx);
        let lb_ip = ctx.deps.first_address(&lb_role, ctx.requester())?.to_string();
        let hosts = ctx.hosts()?;
        let first = hosts
            .first()
            .ok_or_else(|| HandlerError::NoNodes(ctx.unit.id.clone()))?;

        let kubeconfig = ctx
            .run(first, "read-kubeconfig", &scripts::read_kubeconfig(dist, &lb_ip))
            .await?;
        if kubeconfig.is_empty() {
            return Err(HandlerError::Config(format!(
                "{} returned an empty kubeconfig",
                first.address
            )));
        }
        let key = ctx.unit.scoped_key("kubeconfig");
        ctx.publish(key.clone(), DepValue::Str(kubeconfig.clone()))?;
        ctx.export(key, kubeconfig);
        Ok(())
    }

    fn publishes(&self, unit: &WorkUnit) -> Vec<String> {
        vec![unit.scoped_key("kubeconfig")]
    }
}
