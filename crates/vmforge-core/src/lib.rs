//! Shared types, error taxonomy and the backend trait for the appliance
//! lifecycle engine.
//!
//! This crate has no opinion on *how* a VM is launched — that lives in
//! the `vmforge` crate, which owns the state machine, the resolver, the
//! argument builder, and the concrete backends. What lives here is the
//! vocabulary both sides agree on: drives, the appliance triple, handle
//! configuration, hypervisor capabilities, and the [`backend::HypervisorBackend`]
//! trait object boundary.

pub mod appliance;
pub mod backend;
pub mod capabilities;
pub mod config;
pub mod drive;
pub mod error;

pub use appliance::Appliance;
pub use backend::{BackendPaths, BackendVmHandle, HypervisorBackend, LaunchRequest};
pub use capabilities::{CacheStat, HypervisorCapabilities, Version};
pub use config::{BackendSelector, BackendSettings, HandleConfig, MAX_SMP, MIN_MEMSIZE_MIB, VIRTUAL_NIC_SUBNET};
pub use drive::{Drive, DriveOptions, DriveSource, NetworkProtocol, Server, ServerTransport};
pub use error::{Error, Result};
