//! Partition created VMs into role groups.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use crate::config::NodeGroupSpec;
use crate::error::ConfigError;
use crate::providers::VmHandle;

/// Address source of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Addressing {
    /// Addresses known from the description.
    Static,
    /// DHCP, no addresses known.
    Dynamic,
}

/// VMs of one role with their addresses, `ips[i]` belongs to `vms[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeGroup {
    pub vms: Vec<VmHandle>,
    pub ips: Vec<String>,
    pub addressing: Addressing,
}

impl NodeGroup {
    fn new(addressing: Addressing) -> Self {
        Self {
            vms: Vec::new(),
            ips: Vec::new(),
            addressing,
        }
    }

    /// Number of VMs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vms.len()
    }

    /// Whether the group has no VMs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }
}

/// Groups keyed by role.
pub type Groups = BTreeMap<String, NodeGroup>;

/// Assign `created` VMs to the declared groups.
///
/// VMs are consumed in declaration order, `count` at a time. Groups sharing a
/// role are merged. A group with `count: 0` still registers its role, empty.
///
/// # Errors
/// Fails when the declared counts do not add up to `created.len()`, when a
/// static group has fewer addresses than VMs, or when one role mixes static
/// and dynamic addressing.
pub fn group_nodes(created: &[VmHandle], specs: &[NodeGroupSpec]) -> Result<Groups, ConfigError> {
    for spec in specs.iter().filter(|s| s.is_static()) {
        if spec.ips.len() < spec.count {
            return Err(ConfigError::InsufficientAddresses {
                group: spec.name.clone(),
                needed: spec.count,
                available: spec.ips.len(),
            });
        }
    }

    let expected: usize = specs.iter().map(|s| s.count).sum();
    if expected != created.len() {
        return Err(ConfigError::CountMismatch {
            expected,
            actual: created.len(),
        });
    }

    let mut groups = Groups::new();
    let mut remaining = created.iter();
    for spec in specs {
        let addressing = if spec.is_static() {
            Addressing::Static
        } else {
            Addressing::Dynamic
        };
        let group = groups
            .entry(spec.role().to_string())
            .or_insert_with(|| NodeGroup::new(addressing));
        if group.addressing != addressing {
            return Err(ConfigError::Invalid {
                context: format!("role '{}'", spec.role()),
                reason: "groups sharing a role must use the same addressing".into(),
            });
        }

        for (index, vm) in remaining.by_ref().take(spec.count).enumerate() {
            group.vms.push(vm.clone());
            if addressing == Addressing::Static {
                group.ips.push(spec.ips[index].clone());
            }
        }
    }

    for (role, group) in &groups {
        info!(role = %role, vms = group.len(), ips = ?group.ips, "Grouped VMs");
    }
    Ok(groups)
}
