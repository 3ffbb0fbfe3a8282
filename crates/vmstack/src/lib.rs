//! Declarative VM provisioning and cluster configuration for Proxmox VE.
//!
//! A run reads one YAML cluster description and then:
//!
//! 1. creates every VM with bounded retry ([`creator`]),
//! 2. partitions the VMs into role groups ([`grouping`]),
//! 3. publishes each group's handles and addresses in a run-scoped
//!    [`DependencyMap`],
//! 4. executes every action and service in dependency order ([`executor`]),
//!    each through its registered [`handlers`] entry.
//!
//! # Example
//!
//! ```rust,ignore
//! use vmstack::{run, ClusterConfig, HandlerRegistry, Secrets, SshExecutor};
//! use vmstack::providers::proxmox::{Proxmox, ProxmoxConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClusterConfig::load("cluster.yaml".as_ref())?;
//!     let registry = HandlerRegistry::with_defaults();
//!     let prepared = run::prepare(config, &registry, Some(&ssh_key))?;
//!
//!     let proxmox = Proxmox::new(ProxmoxConfig::new(endpoint, token))?;
//!     let summary = run::apply(
//!         &prepared,
//!         &proxmox,
//!         &registry,
//!         &SshExecutor::new(None),
//!         &Secrets::default(),
//!     )
//!     .await?;
//!     println!("{:?}", summary.outputs);
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod creator;
pub mod deps;
pub mod error;
pub mod executor;
pub mod grouping;
pub mod handlers;
pub mod providers;
pub mod remote;
pub mod run;
pub mod scripts;

pub use config::ClusterConfig;
pub use deps::{DepValue, DependencyMap};
pub use executor::{ExecutionPlan, ExecutionReport, Executor, Roles, WorkUnit};
pub use handlers::{HandlerRegistry, Secrets, UnitContext, UnitHandler};
pub use providers::{Hypervisor, ProviderError, VmHandle, VmRequest};
pub use remote::{RemoteExecutor, RemoteHost, SshExecutor};
