//! The appliance lifecycle engine: the [`handle::Handle`] state machine,
//! the hypervisor argument builder, the resolver/probe/supervisor that
//! feed it, and the two pluggable launch backends.
//!
//! `vmforge-core` defines the vocabulary (drives, config, the backend
//! trait); `vmforge-protocol` defines the wire format; this crate wires
//! both together into something a caller can actually launch and talk
//! to. See [`handle::Handle`] for the entry point.

pub mod argv;
pub mod backend;
pub mod connection;
pub mod drives;
pub mod handle;
pub mod probe;
pub mod resolver;
pub mod rpc;
pub mod supervisor;

pub use handle::{Handle, HandleState};
pub use vmforge_core::{
    drive::{Drive, DriveOptions, DriveSource, NetworkProtocol, Server, ServerTransport},
    config::{BackendSelector, BackendSettings, HandleConfig, MAX_SMP, MIN_MEMSIZE_MIB},
    error::{Error, Result},
};
