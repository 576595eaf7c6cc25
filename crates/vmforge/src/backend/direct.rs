//! Direct backend (C8, in-process child): forks the hypervisor itself
//! and owns its pid directly, with an optional recovery watcher that
//! kills the hypervisor if this process dies first.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;

use vmforge_core::backend::{BackendVmHandle, HypervisorBackend, LaunchRequest};
use vmforge_core::error::{external_command_error, Error, Result};

use crate::supervisor::{CommandSpec, Supervisor};

const RECOVERY_POLL_INTERVAL: Duration = Duration::from_secs(2);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

/// Launches the hypervisor as a direct child of this process.
pub struct DirectBackend {
    /// Optional explicit hypervisor binary, overriding
    /// [`vmforge_core::config::HandleConfig::hypervisor_binary`] when set
    /// (this is the backend selector's own `direct:<path>` argument).
    hypervisor_binary: Option<PathBuf>,
}

impl DirectBackend {
    pub fn new(hypervisor_binary: Option<PathBuf>) -> Self {
        Self { hypervisor_binary }
    }

    fn resolve_binary(&self, request: &LaunchRequest<'_>) -> PathBuf {
        self.hypervisor_binary
            .clone()
            .or_else(|| request.config.hypervisor_binary.clone())
            .unwrap_or_else(|| PathBuf::from("qemu-system-x86_64"))
    }
}

#[async_trait]
impl HypervisorBackend for DirectBackend {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn create_overlay(&self, source: &Path, overlay_path: &Path) -> Result<()> {
        Supervisor::new(CommandSpec::Argv(vec![
            "qemu-img".into(),
            "create".into(),
            "-f".into(),
            "qcow2".into(),
            "-b".into(),
            source.as_os_str().to_owned(),
            "-F".into(),
            "raw".into(),
            overlay_path.as_os_str().to_owned(),
        ]))
        .run()
        .await?;
        Ok(())
    }

    async fn launch(&self, request: LaunchRequest<'_>) -> Result<Box<dyn BackendVmHandle>> {
        let binary = self.resolve_binary(&request);
        let mut cmd = Command::new(&binary);
        cmd.args(request.argv);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(false);

        // The child installs default dispositions for every signal and
        // unblocks SIGTERM explicitly; the parent never masks, so this
        // only undoes whatever the parent happened to have blocked.
        unsafe {
            cmd.pre_exec(|| {
                for sig in Signal::iterator() {
                    let _ = signal::signal(sig, signal::SigHandler::SigDfl);
                }
                Ok(())
            });
        }

        if request.config.process_group {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(Error::Resource)?;
        let pid = child.id();
        let stderr = child.stderr.take();
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(target: "vmforge::console", "{line}");
                }
            });
        }

        let watcher = if request.config.recovery_proc {
            pid.map(spawn_recovery_watcher)
        } else {
            None
        };

        Ok(Box::new(DirectVmHandle {
            child: Mutex::new(child),
            pid,
            watcher,
        }))
    }

    async fn shutdown(&self, handle: &dyn BackendVmHandle) -> Result<()> {
        handle.shutdown().await
    }

    fn max_disks(&self) -> u32 {
        255
    }
}

/// Polls the existence of the hypervisor pid and this process's parent
/// every [`RECOVERY_POLL_INTERVAL`]; kills the hypervisor if the parent
/// has died (reparented to init/a reaper).
fn spawn_recovery_watcher(hypervisor_pid: u32) -> tokio::task::JoinHandle<()> {
    let original_parent = nix::unistd::getppid();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(RECOVERY_POLL_INTERVAL).await;
            if signal::kill(Pid::from_raw(hypervisor_pid as i32), None).is_err() {
                return; // hypervisor already gone
            }
            if nix::unistd::getppid() != original_parent {
                let _ = signal::kill(Pid::from_raw(hypervisor_pid as i32), Signal::SIGKILL);
                return;
            }
        }
    })
}

struct DirectVmHandle {
    child: Mutex<tokio::process::Child>,
    pid: Option<u32>,
    watcher: Option<tokio::task::JoinHandle<()>>,
}

#[async_trait]
impl BackendVmHandle for DirectVmHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(watcher) = &self.watcher {
            watcher.abort();
        }
        let mut child = self.child.lock().await;
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(());
        }
        if let Some(pid) = self.pid {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        let status = tokio::time::timeout(SHUTDOWN_WAIT, child.wait()).await;
        match status {
            Ok(Ok(status)) if !status.success() && status.code() != Some(0) => {
                // A hypervisor killed by our own SIGTERM is an expected
                // shutdown, not a failure; only a genuinely unexpected
                // nonzero *exit* is surfaced.
                if status.code().is_some() {
                    return Err(external_command_error("hypervisor", status));
                }
                Ok(())
            }
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Error::Resource(e)),
            Err(_) => {
                if let Some(pid) = self.pid {
                    let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmforge_core::appliance::Appliance;
    use vmforge_core::config::HandleConfig;
    use vmforge_core::drive::Drive;

    fn empty_request<'a>(
        config: &'a HandleConfig,
        appliance: &'a Appliance,
        drives: &'a [Option<Drive>],
        console: &'a Path,
        channel: &'a Path,
        argv: &'a [std::ffi::OsString],
    ) -> LaunchRequest<'a> {
        LaunchRequest {
            config,
            appliance,
            drives,
            console_socket: console,
            rpc_socket: channel,
            argv,
        }
    }

    #[tokio::test]
    async fn launch_spawns_and_shutdown_is_idempotent() {
        let backend = DirectBackend::new(Some(PathBuf::from("/bin/sh")));
        let config = HandleConfig::default();
        let appliance = Appliance::new("/dev/null".into(), "/dev/null".into(), "/dev/null".into());
        let drives: Vec<Option<Drive>> = Vec::new();
        let console = PathBuf::from("/tmp/console.sock");
        let channel = PathBuf::from("/tmp/channel.sock");
        let argv = vec!["-c".into(), "sleep 5".into()];
        let request = empty_request(&config, &appliance, &drives, &console, &channel, &argv);

        let handle = backend.launch(request).await.unwrap();
        assert!(handle.pid().is_some());
        handle.shutdown().await.unwrap();
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn max_disks_is_within_bound() {
        let backend = DirectBackend::new(None);
        assert!(backend.max_disks() <= 255);
    }
}
