//! Proxmox VE hypervisor.
//!
//! Implements the [`Hypervisor`](crate::providers::Hypervisor) trait over
//! the Proxmox REST API (`/api2/json`).
//!
//! ## Boot methods
//!
//! - **cloud-init**: full clone of a template, then cores/memory/user/ssh
//!   key/ipconfig, disk resize and start.
//! - **iPXE**: a fresh VM with an installer ISO attached and a disk-first
//!   boot order, used for Harvester clusters.
//!
//! Every mutating call returns a task id (UPID) that is polled until the
//! task stops.

mod client;
mod models;

pub use client::{Proxmox, ProxmoxConfig};
pub use models::*;
