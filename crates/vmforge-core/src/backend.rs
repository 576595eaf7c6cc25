//! The backend plug-in interface: the fixed set of operations a
//! virtualization backend exposes, independent of whether it forks a
//! child directly or delegates to an external daemon.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::appliance::Appliance;
use crate::config::HandleConfig;
use crate::drive::Drive;
use crate::error::Result;

/// Everything a backend needs to launch a VM, assembled by the caller
/// from the handle's current state at the moment `launch` is called.
/// A backend must never mutate this outside documented fields, and
/// must never reorder `drives`.
#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    pub config: &'a HandleConfig,
    pub appliance: &'a Appliance,
    pub drives: &'a [Option<Drive>],
    pub console_socket: &'a Path,
    pub rpc_socket: &'a Path,
    /// Fully built hypervisor argv (the argument builder's output), used
    /// verbatim by the direct backend's exec. The delegated backend
    /// ignores this and derives an equivalent XML domain document from
    /// the same config/appliance/drives instead.
    pub argv: &'a [std::ffi::OsString],
}

/// A running VM, as seen by the handle that launched it.
#[async_trait]
pub trait BackendVmHandle: Send + Sync {
    /// Host process id if this backend has one; `None` for domains whose
    /// lifecycle lives entirely inside an external daemon.
    fn pid(&self) -> Option<u32>;

    /// Tears the VM down. Idempotent: calling shutdown twice is not an
    /// error.
    async fn shutdown(&self) -> Result<()>;
}

/// A pluggable virtualization backend, registered at process init by
/// name (see `vmforge::backend::select_backend`).
#[async_trait]
pub trait HypervisorBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Creates a qcow2 overlay backed by `source`, writing it to
    /// `overlay_path`. Used both for readonly drives and for the
    /// appliance root image.
    async fn create_overlay(&self, source: &Path, overlay_path: &Path) -> Result<()>;

    /// Brings the VM up per `request` and returns a handle to it. By the
    /// time this returns, the backend has started the child/domain but
    /// has not necessarily observed the in-band ready sentinel — that is
    /// the caller's job, over the sockets it already opened.
    async fn launch(&self, request: LaunchRequest<'_>) -> Result<Box<dyn BackendVmHandle>>;

    /// Tears the VM down. Equivalent to calling `shutdown` on the handle
    /// returned by `launch`, kept on the backend trait because some
    /// callers (the at-exit cleanup path) no longer hold that handle.
    async fn shutdown(&self, handle: &dyn BackendVmHandle) -> Result<()>;

    /// The pid of the running VM process, if any.
    fn get_pid(&self, handle: &dyn BackendVmHandle) -> Option<u32> {
        handle.pid()
    }

    /// The largest number of drives this backend can attach, including
    /// the appliance image itself.
    fn max_disks(&self) -> u32;
}

/// Filesystem layout a backend is handed at launch time: everything
/// that needs to live somewhere on disk for the duration of the VM.
#[derive(Debug, Clone)]
pub struct BackendPaths {
    pub temp_dir: PathBuf,
    pub socket_dir: PathBuf,
}
