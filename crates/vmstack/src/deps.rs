//! Run-scoped store for values passed between units.
//!
//! Every group publishes `<role>-vms` and `<role>-ips`. Handlers add their
//! own keys (join tokens, kubeconfigs) for later units. A key is written
//! once and never replaced, so a value read by one unit stays valid for
//! the rest of the run.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::DepError;
use crate::grouping::{Addressing, Groups};
use crate::providers::VmHandle;

/// Value stored under one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepValue {
    Str(String),
    Strings(Vec<String>),
    Handle(VmHandle),
    Handles(Vec<VmHandle>),
    /// Addresses come from DHCP and are unknown.
    Dynamic,
}

impl DepValue {
    fn kind(&self) -> &'static str {
        match self {
            Self::Str(_) => "a string",
            Self::Strings(_) => "a string list",
            Self::Handle(_) => "a VM handle",
            Self::Handles(_) => "a VM handle list",
            Self::Dynamic => "dynamic addresses",
        }
    }
}

/// Key for a group's VM handles.
#[must_use]
pub fn vms_key(role: &str) -> String {
    format!("{role}-vms")
}

/// Key for a group's addresses.
#[must_use]
pub fn ips_key(role: &str) -> String {
    format!("{role}-ips")
}

/// Shared key-value space of one run.
#[derive(Debug, Default)]
pub struct DependencyMap {
    values: BTreeMap<String, DepValue>,
}

impl DependencyMap {
    /// Empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `<role>-vms` and `<role>-ips` for every group.
    ///
    /// Dynamically addressed groups get [`DepValue::Dynamic`] in place of an
    /// address list.
    #[must_use]
    pub fn build(groups: &Groups) -> Self {
        let mut map = Self::new();
        for (role, group) in groups {
            map.values
                .insert(vms_key(role), DepValue::Handles(group.vms.clone()));
            let ips = match group.addressing {
                Addressing::Static => DepValue::Strings(group.ips.clone()),
                Addressing::Dynamic => DepValue::Dynamic,
            };
            map.values.insert(ips_key(role), ips);
        }
        map
    }

    /// Write `key` once.
    ///
    /// # Errors
    /// Returns `DepError::AlreadyWritten` if the key exists.
    pub fn insert(&mut self, key: impl Into<String>, value: DepValue) -> Result<(), DepError> {
        let key = key.into();
        if self.values.contains_key(&key) {
            return Err(DepError::AlreadyWritten { key });
        }
        debug!(key = %key, kind = value.kind(), "Published dependency");
        self.values.insert(key, value);
        Ok(())
    }

    /// Whether `key` has been written.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Raw value under `key`.
    ///
    /// # Errors
    /// Returns `DepError::Missing` naming `requester` if the key is absent.
    pub fn get(&self, key: &str, requester: &str) -> Result<&DepValue, DepError> {
        self.values.get(key).ok_or_else(|| DepError::Missing {
            key: key.to_string(),
            requester: requester.to_string(),
        })
    }

    /// String under `key`.
    ///
    /// # Errors
    /// Fails if the key is absent or holds another kind of value.
    pub fn get_str(&self, key: &str, requester: &str) -> Result<&str, DepError> {
        match self.get(key, requester)? {
            DepValue::Str(value) => Ok(value),
            other => Err(mismatch(key, "a string", other)),
        }
    }

    /// String list under `key`.
    ///
    /// # Errors
    /// Fails if the key is absent or holds another kind of value.
    pub fn get_strings(&self, key: &str, requester: &str) -> Result<&[String], DepError> {
        match self.get(key, requester)? {
            DepValue::Strings(values) => Ok(values),
            other => Err(mismatch(key, "a string list", other)),
        }
    }

    /// VM handle under `key`.
    ///
    /// # Errors
    /// Fails if the key is absent or holds another kind of value.
    pub fn get_handle(&self, key: &str, requester: &str) -> Result<&VmHandle, DepError> {
        match self.get(key, requester)? {
            DepValue::Handle(handle) => Ok(handle),
            other => Err(mismatch(key, "a VM handle", other)),
        }
    }

    /// VM handle list under `key`.
    ///
    /// # Errors
    /// Fails if the key is absent or holds another kind of value.
    pub fn get_handles(&self, key: &str, requester: &str) -> Result<&[VmHandle], DepError> {
        match self.get(key, requester)? {
            DepValue::Handles(handles) => Ok(handles),
            other => Err(mismatch(key, "a VM handle list", other)),
        }
    }

    /// Addresses of `role`, `None` when the role uses DHCP.
    ///
    /// # Errors
    /// Fails if the role was never published.
    pub fn addresses(&self, role: &str, requester: &str) -> Result<Option<&[String]>, DepError> {
        let key = ips_key(role);
        match self.get(&key, requester)? {
            DepValue::Strings(ips) => Ok(Some(ips)),
            DepValue::Dynamic => Ok(None),
            other => Err(mismatch(&key, "a string list", other)),
        }
    }

    /// Static addresses of `role`.
    ///
    /// # Errors
    /// Fails if the role was never published or uses DHCP.
    pub fn static_addresses(&self, role: &str, requester: &str) -> Result<&[String], DepError> {
        self.addresses(role, requester)?
            .ok_or_else(|| DepError::DynamicAddresses {
                group: role.to_string(),
            })
    }

    /// First static address of `role`.
    ///
    /// # Errors
    /// Fails if the role has no static address.
    pub fn first_address(&self, role: &str, requester: &str) -> Result<&str, DepError> {
        self.static_addresses(role, requester)?
            .first()
            .map(String::as_str)
            .ok_or_else(|| DepError::Missing {
                key: ips_key(role),
                requester: requester.to_string(),
            })
    }

    /// Iterate over all keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

fn mismatch(key: &str, expected: &'static str, found: &DepValue) -> DepError {
    DepError::TypeMismatch {
        key: key.to_string(),
        expected,
        found: found.kind(),
    }
}
