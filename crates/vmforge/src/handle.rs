//! Handle + state machine (C9): owns every other component, enforces
//! single-call-at-a-time entry, and is the only thing application code
//! talks to directly.
//!
//! ```text
//!   Config ──add_drive/config──▶ Config
//!   Config ──launch──▶ Launching ──guest ready sentinel──▶ Ready
//!   Launching/Ready ──shutdown or fatal──▶ Config
//! ```
//! `close` consumes the handle outright, so the terminal `NO_HANDLE`
//! state from the design is modeled by the handle no longer existing
//! rather than as a fourth variant here.

use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, OnceLock};

use tokio::net::UnixListener;
use tokio::sync::Mutex as AsyncMutex;

use vmforge_core::appliance::Appliance;
use vmforge_core::backend::{BackendVmHandle, HypervisorBackend, LaunchRequest};
use vmforge_core::capabilities::HypervisorCapabilities;
use vmforge_core::config::HandleConfig;
use vmforge_core::drive::{Drive, DriveOptions, DriveSource};
use vmforge_core::error::{Error, Result};

use crate::argv::{self, BuildContext};
use crate::backend;
use crate::connection::{Connection, ConsoleBytes};
use crate::drives::DriveVector;
use crate::probe;
use crate::resolver;
use crate::rpc::{HandleEventSink, RpcClient};
use vmforge_protocol::channel::AsyncEvent;

/// The three live states; `NO_HANDLE` is "this value has been dropped
/// by [`Handle::close`]".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Config,
    Launching,
    Ready,
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide registry of handles that opted into at-exit cleanup,
/// behind the usual `OnceLock<Mutex<...>>` lazy-static shape.
static OPEN_HANDLES: OnceLock<StdMutex<HashMap<u64, std::sync::Weak<AtomicBool>>>> =
    OnceLock::new();

fn open_handles() -> &'static StdMutex<HashMap<u64, std::sync::Weak<AtomicBool>>> {
    OPEN_HANDLES.get_or_init(|| StdMutex::new(HashMap::new()))
}

/// Closes every handle that is still open and registered for at-exit
/// cleanup, by flipping its cancel flag so any in-flight call unwinds
/// and the application's own drop path tears it down. Intended to be
/// called once from the host application's shutdown path, since Rust
/// has no implicit atexit hook into library state.
pub fn request_close_all_open_handles() {
    let registry = open_handles().lock().unwrap();
    for weak in registry.values() {
        if let Some(flag) = weak.upgrade() {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

/// One subscribed event callback, matching the `(bitmask, callback,
/// opaque1, opaque2)` shape from the design: `bitmask` selects which
/// [`AsyncEvent`] kinds are delivered, `opaque1`/`opaque2` are
/// caller-owned tokens threaded back through every invocation.
pub struct EventSubscription {
    pub bitmask: u64,
    pub opaque1: i64,
    pub opaque2: i64,
    callback: Box<dyn Fn(&AsyncEvent, i64, i64) + Send + Sync>,
}

pub const EVENT_PROGRESS: u64 = 1 << 0;
pub const EVENT_LOG: u64 = 1 << 1;
pub const EVENT_CANCEL: u64 = 1 << 2;
pub const EVENT_CONSOLE: u64 = 1 << 3;

fn event_bit(event: &AsyncEvent) -> u64 {
    match event {
        AsyncEvent::Progress(_) => EVENT_PROGRESS,
        AsyncEvent::Log(_) => EVENT_LOG,
        AsyncEvent::Cancel => EVENT_CANCEL,
    }
}

/// Filesystem paths a handle lazily creates the first time it needs
/// somewhere to put sockets or overlay images.
struct HandleDirs {
    temp: tempfile::TempDir,
    socket: tempfile::TempDir,
}

/// `sizeof(sockaddr_un.sun_path)` on Linux; a candidate socket directory
/// whose path would leave no room for a filename under this limit is
/// rejected in favor of the next candidate.
const SUN_PATH_MAX: usize = 108;

/// A socket name long enough to bound how much of [`SUN_PATH_MAX`] must
/// remain free in a candidate directory (`console.sock`/`channel.sock`
/// plus the tempdir's own random suffix, rounded up generously).
const SOCKET_NAME_RESERVE: usize = 32;

/// Picks the directory a handle's console/channel sockets are created
/// in, preferring `XDG_RUNTIME_DIR` over the system temp root when it
/// exists and the resulting path leaves enough room under
/// `sun_path`'s length limit.
fn socket_tempdir() -> Result<tempfile::TempDir> {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        let runtime_dir = std::path::PathBuf::from(runtime_dir);
        if runtime_dir.is_dir() && runtime_dir.as_os_str().len() + SOCKET_NAME_RESERVE < SUN_PATH_MAX {
            if let Ok(dir) = tempfile::Builder::new()
                .prefix("vmforge-sock-")
                .tempdir_in(&runtime_dir)
            {
                return Ok(dir);
            }
        }
    }
    tempfile::Builder::new()
        .prefix("vmforge-sock-")
        .tempdir()
        .map_err(Error::Resource)
}

/// Everything a launched handle keeps alive until shutdown.
struct RunningVm {
    vm_handle: Box<dyn BackendVmHandle>,
    connection: AsyncMutex<Connection>,
    rpc: RpcClient,
}

/// The appliance lifecycle engine's top-level object.
pub struct Handle {
    id: u64,
    state: HandleState,
    config: HandleConfig,
    drives: DriveVector,
    capabilities: Option<HypervisorCapabilities>,
    appliance: Option<Appliance>,
    backend: Option<Box<dyn HypervisorBackend>>,
    running: Option<RunningVm>,
    dirs: Option<HandleDirs>,
    events: Vec<EventSubscription>,
    private_data: HashMap<String, Box<dyn Any + Send>>,
    errors: Vec<(i32, String)>,
    cancel_flag: std::sync::Arc<AtomicBool>,
    close_on_exit: bool,
    console_rx: Option<tokio::sync::mpsc::UnboundedReceiver<ConsoleBytes>>,
}

impl Handle {
    /// Creates a new handle in `Config` state with default
    /// configuration. Does not touch the filesystem or the environment;
    /// see [`HandleConfig::from_env`] for picking up the environment
    /// variable table separately.
    pub fn new() -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::SeqCst),
            state: HandleState::Config,
            config: HandleConfig::default(),
            drives: DriveVector::new(),
            capabilities: None,
            appliance: None,
            backend: None,
            running: None,
            dirs: None,
            events: Vec::new(),
            private_data: HashMap::new(),
            errors: Vec::new(),
            cancel_flag: std::sync::Arc::new(AtomicBool::new(false)),
            close_on_exit: false,
            console_rx: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn config(&self) -> &HandleConfig {
        &self.config
    }

    /// Mutable access to configuration, valid only in `Config` state.
    pub fn config_mut(&mut self) -> Result<&mut HandleConfig> {
        self.require_state(HandleState::Config)?;
        Ok(&mut self.config)
    }

    fn require_state(&self, expected: HandleState) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidConfig(format!(
                "operation requires state {expected:?}, handle is in {:?}",
                self.state
            )));
        }
        Ok(())
    }

    /// Opts this handle into [`request_close_all_open_handles`]'s
    /// at-exit sweep.
    pub fn register_for_close_on_exit(&mut self) {
        self.close_on_exit = true;
        open_handles()
            .lock()
            .unwrap()
            .insert(self.id, std::sync::Arc::downgrade(&self.cancel_flag));
    }

    // ---- drives ----------------------------------------------------

    pub fn add_drive(&mut self, source: DriveSource, opts: DriveOptions) -> Result<usize> {
        self.require_state(HandleState::Config)?;
        self.drives.add_drive(source, opts)
    }

    pub fn drive(&self, index: usize) -> Option<&Drive> {
        self.drives.get(index)
    }

    pub fn drive_count(&self) -> usize {
        self.drives.len()
    }

    // ---- error stack -------------------------------------------------

    pub fn last_error(&self) -> Option<(i32, &str)> {
        self.errors.last().map(|(errno, msg)| (*errno, msg.as_str()))
    }

    pub fn push_error(&mut self, errno: i32, message: impl Into<String>) {
        self.errors.push((errno, message.into()));
    }

    /// Suppresses the current last error for the duration of a probe
    /// that may legitimately fail, returning it so the caller can
    /// restore it with [`Handle::push_error`] if the probe did fail.
    pub fn pop_error(&mut self) -> Option<(i32, String)> {
        self.errors.pop()
    }

    // ---- private data --------------------------------------------------

    pub fn set_private_data(&mut self, key: impl Into<String>, value: Box<dyn Any + Send>) {
        self.private_data.insert(key.into(), value);
    }

    pub fn clear_private_data(&mut self, key: &str) {
        self.private_data.remove(key);
    }

    pub fn get_private_data(&self, key: &str) -> Option<&(dyn Any + Send)> {
        self.private_data.get(key).map(|b| b.as_ref())
    }

    /// Iterates non-null private-data entries; there is nothing to skip
    /// since [`Handle::clear_private_data`] removes the entry outright
    /// rather than writing a null placeholder.
    pub fn iter_private_data(&self) -> impl Iterator<Item = (&str, &(dyn Any + Send))> {
        self.private_data.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    // ---- events ------------------------------------------------------

    /// Subscribes to events whose bit is set in `bitmask`. Returns an
    /// index usable with [`Handle::unsubscribe`].
    pub fn subscribe(
        &mut self,
        bitmask: u64,
        opaque1: i64,
        opaque2: i64,
        callback: impl Fn(&AsyncEvent, i64, i64) + Send + Sync + 'static,
    ) -> usize {
        self.events.push(EventSubscription {
            bitmask,
            opaque1,
            opaque2,
            callback: Box::new(callback),
        });
        self.events.len() - 1
    }

    pub fn unsubscribe(&mut self, index: usize) {
        if index < self.events.len() {
            self.events.remove(index);
        }
    }

    /// Fan-out for a single async event. Never called while `self` is
    /// borrowed mutably elsewhere: callbacks must be able to re-enter
    /// with another public call without deadlocking, so this is always
    /// invoked against data already read out of the handle, not while
    /// holding a mutable borrow across the call.
    fn call_callbacks(&self, event: &AsyncEvent) {
        let bit = event_bit(event);
        for subscription in &self.events {
            if subscription.bitmask & bit != 0 {
                (subscription.callback)(event, subscription.opaque1, subscription.opaque2);
            }
        }
    }

    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    fn dirs(&mut self) -> Result<&HandleDirs> {
        if self.dirs.is_none() {
            let temp = tempfile::tempdir().map_err(Error::Resource)?;
            let socket = socket_tempdir()?;
            self.dirs = Some(HandleDirs { temp, socket });
        }
        Ok(self.dirs.as_ref().unwrap())
    }

    // ---- launch ------------------------------------------------------

    /// Drives `Config -> Launching -> Ready`: resolves/probes/builds
    /// the argv, launches the backend, accepts both sockets, and waits
    /// for the guest's ready sentinel.
    pub async fn launch(&mut self) -> Result<()> {
        self.require_state(HandleState::Config)?;
        self.state = HandleState::Launching;

        match self.launch_inner().await {
            Ok(()) => {
                self.state = HandleState::Ready;
                Ok(())
            }
            Err(e) => {
                // Protocol/resource errors during launch return the
                // handle to `Config`, per the error handling design.
                self.teardown_running().await;
                self.state = HandleState::Config;
                Err(e)
            }
        }
    }

    async fn launch_inner(&mut self) -> Result<()> {
        let cache_dir = probe::default_cache_dir();

        let hypervisor_binary = self
            .config
            .hypervisor_binary
            .clone()
            .or_else(|| which::which("qemu-system-x86_64").ok())
            .ok_or_else(|| Error::InvalidConfig("no hypervisor binary configured or found on PATH".to_string()))?;

        let capabilities = probe::probe(&hypervisor_binary, &cache_dir).await?;

        let search_path = self
            .config
            .search_path
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":");
        let host_cpu = std::env::consts::ARCH;
        let appliance = resolver::resolve(&search_path, &cache_dir, host_cpu).await?;

        let backend_instance = backend::select_backend(
            &self.config.backend.name,
            self.config.backend.argument.as_deref(),
        )?;

        let appliance_overlay = {
            let dirs = self.dirs()?;
            dirs.temp.path().join("appliance-overlay.qcow2")
        };
        backend_instance
            .create_overlay(&appliance.root_fs, &appliance_overlay)
            .await?;

        let (console_path, rpc_path) = {
            let dirs = self.dirs()?;
            (
                dirs.socket.path().join("console.sock"),
                dirs.socket.path().join("channel.sock"),
            )
        };
        {
            let overlay_dir = self.dirs()?.temp.path().to_path_buf();
            self.drives
                .materialize_overlays(backend_instance.as_ref(), &overlay_dir)
                .await?;
        }

        let ctx = BuildContext {
            config: &self.config,
            capabilities: &capabilities,
            drives: &self.drives,
            appliance_overlay: &appliance_overlay,
            kernel: &appliance.kernel,
            initrd: &appliance.initrd,
            uefi: None,
            force_kvm: false,
            force_tcg: false,
            cpu_model: "host",
            machine_type: "pc",
            console_socket: &console_path,
            rpc_socket: &rpc_path,
        };
        let opaque_params = argv::backend_settings_to_opaque_params(&self.config.backend_settings);
        let argv = argv::build_argv(&ctx, &opaque_params)?;

        let console_listener = UnixListener::bind(&console_path).map_err(Error::Resource)?;
        let channel_listener = UnixListener::bind(&rpc_path).map_err(Error::Resource)?;

        let launch_request = LaunchRequest {
            config: &self.config,
            appliance: &appliance,
            drives: self.drives.as_slice(),
            console_socket: &console_path,
            rpc_socket: &rpc_path,
            argv: &argv,
        };
        let vm_handle = backend_instance.launch(launch_request).await?;
        self.drives.add_dummy_appliance_drive();

        let (console_tx, console_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut connection = Connection::listening(console_listener, channel_listener, console_tx);
        connection.accept().await?;

        let rpc = RpcClient::new();
        rpc.wait_for_ready(&mut connection).await?;

        self.capabilities = Some(capabilities);
        self.appliance = Some(appliance);
        self.backend = Some(backend_instance);
        self.console_rx = Some(console_rx);
        self.running = Some(RunningVm {
            vm_handle,
            connection: AsyncMutex::new(connection),
            rpc,
        });
        Ok(())
    }

    /// Makes one RPC call against the running guest daemon, delivering
    /// progress/log events to this handle's subscribers and cancel
    /// events to the handle's cancel flag.
    pub async fn call<A, R>(&self, procedure: u32, optargs_bitmask: u64, args: A) -> Result<R>
    where
        A: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        self.require_state(HandleState::Ready)?;
        let running = self
            .running
            .as_ref()
            .ok_or(Error::HandleClosed)?;
        let mut pending = Vec::new();
        let result = {
            let mut connection = running.connection.lock().await;
            let mut collect = |event: AsyncEvent| pending.push(event);
            let sink = HandleEventSink {
                cancel_flag: &self.cancel_flag,
                on_event: &mut collect,
            };
            running
                .rpc
                .call(&mut connection, procedure, optargs_bitmask, args, sink)
                .await
        };
        for event in &pending {
            self.call_callbacks(event);
        }
        result
    }

    // ---- shutdown / close ---------------------------------------------

    /// Tears the VM down and returns the handle to `Config`. An
    /// implicit sync would be invoked here first when `autosync` is
    /// set and the handle is `Ready`; no guest-side sync procedure is
    /// implemented by this crate, so the hook is a no-op placeholder
    /// kept for the contract's sake.
    pub async fn shutdown(&mut self, check_errors: bool) -> Result<()> {
        if self.state == HandleState::Config {
            return Ok(());
        }
        let result = self.teardown_running().await;
        self.state = HandleState::Config;
        if check_errors {
            result
        } else {
            Ok(())
        }
    }

    async fn teardown_running(&mut self) -> Result<()> {
        if let Some(running) = self.running.take() {
            running.vm_handle.shutdown().await?;
        }
        self.console_rx = None;
        self.capabilities = None;
        self.appliance = None;
        self.backend = None;
        // Every launch starts clean: free the whole drive vector,
        // including any caller-added drives, not just the dummy
        // appliance slot appended during LAUNCHING.
        self.drives.free_all();
        Ok(())
    }

    /// Tears everything down unconditionally: unsubscribes from the
    /// at-exit registry, drops drives/capabilities/private data/error
    /// stack/temp+socket directories, and marks the handle closed.
    /// Calling this on an already-closed handle is a diagnostic, not an
    /// error — mirrored here by simply being a no-op on the second call
    /// since `close` takes `self` by value.
    pub async fn close(mut self) {
        let _ = self.teardown_running().await;
        open_handles().lock().unwrap().remove(&self.id);
        self.drives.free_all();
        self.private_data.clear();
        self.errors.clear();
        self.events.clear();
        self.dirs = None;
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_handle_starts_in_config_state() {
        let handle = Handle::new();
        assert_eq!(handle.state(), HandleState::Config);
    }

    #[test]
    fn config_mut_rejected_outside_config_state() {
        let mut handle = Handle::new();
        handle.state = HandleState::Ready;
        assert!(handle.config_mut().is_err());
    }

    #[test]
    fn add_drive_rejected_outside_config_state() {
        let mut handle = Handle::new();
        handle.state = HandleState::Launching;
        let err = handle
            .add_drive(DriveSource::Local("/dev/null".into()), DriveOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn error_stack_push_pop() {
        let mut handle = Handle::new();
        assert!(handle.last_error().is_none());
        handle.push_error(2, "No such file or directory");
        assert_eq!(handle.last_error(), Some((2, "No such file or directory")));
        let popped = handle.pop_error().unwrap();
        assert_eq!(popped.0, 2);
        assert!(handle.last_error().is_none());
    }

    #[test]
    fn private_data_roundtrip_and_clear() {
        let mut handle = Handle::new();
        handle.set_private_data("answer", Box::new(42i32));
        assert_eq!(
            handle.get_private_data("answer").and_then(|v| v.downcast_ref::<i32>()),
            Some(&42)
        );
        handle.clear_private_data("answer");
        assert!(handle.get_private_data("answer").is_none());
    }

    #[test]
    fn event_subscription_receives_matching_bitmask_only() {
        let mut handle = Handle::new();
        let seen = std::sync::Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        handle.subscribe(EVENT_LOG, 0, 0, move |event, _, _| {
            seen_clone.lock().unwrap().push(format!("{event:?}"));
        });

        handle.call_callbacks(&AsyncEvent::Cancel);
        assert!(seen.lock().unwrap().is_empty());

        handle.call_callbacks(&AsyncEvent::Log(vmforge_protocol::header::LogMessage {
            text: "hello".to_string(),
        }));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn shutdown_on_already_config_handle_is_a_noop() {
        let mut handle = Handle::new();
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            handle.shutdown(true).await.unwrap();
        });
        assert_eq!(handle.state(), HandleState::Config);
    }

    #[test]
    fn register_for_close_on_exit_adds_to_registry() {
        let mut handle = Handle::new();
        handle.register_for_close_on_exit();
        assert!(open_handles().lock().unwrap().contains_key(&handle.id()));
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(handle.close());
    }
}
