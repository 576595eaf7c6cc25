//! Delegated backend (C8, external virtualization daemon): describes
//! the same machine as an XML domain document and asks an external
//! daemon, reached over a control socket, to start it in auto-destroy
//! mode so it dies with the host connection.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;

use vmforge_core::backend::{BackendVmHandle, HypervisorBackend, LaunchRequest};
use vmforge_core::drive::DriveSource;
use vmforge_core::error::{Error, Result};
use vmforge_protocol::envelope::{decode, encode};
use vmforge_protocol::frame::{read_frame, write_frame, FrameKind};

/// Requests this backend sends to the external daemon over the control
/// socket. Not the guest channel protocol — this is a private,
/// process-local wire format between the handle and the daemon.
#[derive(Debug, Serialize, Deserialize)]
enum DomainRequest {
    PushSecret { uuid: String, value: String },
    DefineAndStart { xml: String },
    Destroy { domain_id: String },
    CreateOverlay { source: PathBuf, overlay: PathBuf },
}

#[derive(Debug, Serialize, Deserialize)]
enum DomainReply {
    Ok,
    OkWithPid(u32),
    Busy,
    Err(String),
}

async fn call(control_socket: &std::path::Path, request: &DomainRequest) -> Result<DomainReply> {
    let mut stream = UnixStream::connect(control_socket)
        .await
        .map_err(Error::Resource)?;
    let payload = encode(request).map_err(|e| Error::Protocol(e.to_string()))?;
    write_frame(&mut stream, FrameKind::Data, &payload)
        .await
        .map_err(|e| Error::Protocol(e.to_string()))?;
    let (_, reply_payload) = read_frame(&mut stream)
        .await
        .map_err(|e| Error::Protocol(e.to_string()))?
        .ok_or_else(|| Error::Protocol("control socket closed before a reply arrived".to_string()))?;
    decode(&reply_payload).map_err(|e| Error::Protocol(e.to_string()))
}

pub struct DelegatedBackend {
    control_socket: PathBuf,
}

impl DelegatedBackend {
    pub fn new(control_socket: PathBuf) -> Self {
        Self { control_socket }
    }
}

fn domain_xml(request: &LaunchRequest<'_>, drive_uuids: &[(usize, String)]) -> Result<String> {
    let mut xml = String::new();
    xml.push_str("<domain type='kvm'>\n");
    xml.push_str(&format!("  <name>{}</name>\n", request.config.program_name));
    xml.push_str(&format!("  <memory unit='MiB'>{}</memory>\n", request.config.memsize_mib));
    xml.push_str(&format!("  <vcpu>{}</vcpu>\n", request.config.smp));
    xml.push_str("  <os>\n");
    xml.push_str(&format!("    <kernel>{}</kernel>\n", request.appliance.kernel.display()));
    xml.push_str(&format!("    <initrd>{}</initrd>\n", request.appliance.initrd.display()));
    if let Some(append) = &request.config.append {
        xml.push_str(&format!("    <cmdline>{append}</cmdline>\n"));
    }
    xml.push_str("  </os>\n");
    xml.push_str("  <devices>\n");

    for (index, drive) in request.drives.iter().enumerate() {
        let Some(drive) = drive else { continue };
        let uri = drive.format_uri()?;
        let auth = drive_uuids
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, uuid)| format!("<auth uuid='{uuid}'/>"))
            .unwrap_or_default();
        let readonly = if drive.is_readonly() { "<readonly/>" } else { "" };
        xml.push_str(&format!(
            "    <disk type='{}' device='disk'>\n      <source uri='{uri}'/>\n      {auth}{readonly}\n    </disk>\n",
            if drive.is_block_device() { "block" } else { "file" }
        ));
    }

    let appliance_overlay_path = request
        .argv
        .iter()
        .find(|a| a.to_string_lossy().contains("snapshot=on"))
        .and_then(|a| {
            a.to_string_lossy()
                .split(',')
                .find_map(|field| field.strip_prefix("file=").map(str::to_string))
        })
        .unwrap_or_default();
    xml.push_str(&format!(
        "    <disk type='file' device='disk' snapshot='on'>\n      <source file='{appliance_overlay_path}'/>\n    </disk>\n",
    ));

    xml.push_str("    <console type='unix'>\n");
    xml.push_str(&format!("      <source path='{}'/>\n", request.console_socket.display()));
    xml.push_str("    </console>\n");
    xml.push_str("    <channel type='unix'>\n");
    xml.push_str(&format!("      <source path='{}'/>\n", request.rpc_socket.display()));
    xml.push_str("      <target type='virtio' name='org.libguestfs.channel.0'/>\n");
    xml.push_str("    </channel>\n");
    xml.push_str("    <rng model='virtio'>\n      <backend model='random'>/dev/urandom</backend>\n    </rng>\n");

    if request.config.enable_network {
        xml.push_str(&format!(
            "    <interface type='user'>\n      <model type='virtio'/>\n      <ip address='{}'/>\n    </interface>\n",
            vmforge_core::config::VIRTUAL_NIC_SUBNET
        ));
    }

    xml.push_str("  </devices>\n");
    xml.push_str("</domain>\n");
    Ok(xml)
}

#[async_trait]
impl HypervisorBackend for DelegatedBackend {
    fn name(&self) -> &'static str {
        "delegated"
    }

    async fn create_overlay(&self, source: &std::path::Path, overlay_path: &std::path::Path) -> Result<()> {
        match call(
            &self.control_socket,
            &DomainRequest::CreateOverlay {
                source: source.to_path_buf(),
                overlay: overlay_path.to_path_buf(),
            },
        )
        .await?
        {
            DomainReply::Ok => Ok(()),
            DomainReply::Err(message) => Err(Error::BackendUnavailable {
                name: "delegated".to_string(),
                reason: message,
            }),
            _ => Err(Error::Protocol("unexpected reply to CreateOverlay".to_string())),
        }
    }

    async fn launch(&self, request: LaunchRequest<'_>) -> Result<Box<dyn BackendVmHandle>> {
        let mut drive_uuids = Vec::new();
        for (index, drive) in request.drives.iter().enumerate() {
            let Some(drive) = drive else { continue };
            if let DriveSource::Network {
                secret: Some(secret),
                ..
            } = &drive.source
            {
                let uuid = uuid::Uuid::new_v4().to_string();
                call(
                    &self.control_socket,
                    &DomainRequest::PushSecret {
                        uuid: uuid.clone(),
                        value: secret.clone(),
                    },
                )
                .await?;
                drive_uuids.push((index, uuid));
            }
        }

        let xml = domain_xml(&request, &drive_uuids)?;
        match call(&self.control_socket, &DomainRequest::DefineAndStart { xml }).await? {
            DomainReply::Ok => Ok(Box::new(DelegatedVmHandle {
                control_socket: self.control_socket.clone(),
                domain_id: request.config.identifier().to_string(),
                pid: None,
            })),
            DomainReply::OkWithPid(pid) => Ok(Box::new(DelegatedVmHandle {
                control_socket: self.control_socket.clone(),
                domain_id: request.config.identifier().to_string(),
                pid: Some(pid),
            })),
            DomainReply::Err(message) => Err(Error::LaunchFailed { reason: message }),
            DomainReply::Busy => Err(Error::LaunchFailed {
                reason: "daemon reported busy while starting the domain".to_string(),
            }),
        }
    }

    async fn shutdown(&self, handle: &dyn BackendVmHandle) -> Result<()> {
        handle.shutdown().await
    }

    fn max_disks(&self) -> u32 {
        // One slot is reserved for the appliance image itself.
        254
    }
}

struct DelegatedVmHandle {
    control_socket: PathBuf,
    domain_id: String,
    pid: Option<u32>,
}

#[async_trait]
impl BackendVmHandle for DelegatedVmHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Retries the graceful destroy indefinitely while the daemon
    /// reports `Busy` (`EBUSY`), per the recovery policy.
    async fn shutdown(&self) -> Result<()> {
        loop {
            let reply = call(
                &self.control_socket,
                &DomainRequest::Destroy {
                    domain_id: self.domain_id.clone(),
                },
            )
            .await?;
            match reply {
                DomainReply::Ok | DomainReply::OkWithPid(_) => return Ok(()),
                DomainReply::Busy => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
                DomainReply::Err(message) => {
                    return Err(Error::BackendUnavailable {
                        name: "delegated".to_string(),
                        reason: message,
                    })
                }
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

    #[test]
    fn domain_xml_includes_channel_name() {
        let config = HandleConfig::default();
        let appliance = Appliance::new("/k".into(), "/i".into(), "/r".into());
        let drives: Vec<Option<Drive>> = Vec::new();
        let console = PathBuf::from("/tmp/console.sock");
        let channel = PathBuf::from("/tmp/channel.sock");
        let argv: Vec<std::ffi::OsString> = Vec::new();
        let request = LaunchRequest {
            config: &config,
            appliance: &appliance,
            drives: &drives,
            console_socket: &console,
            rpc_socket: &channel,
            argv: &argv,
        };
        let xml = domain_xml(&request, &[]).unwrap();
        assert!(xml.contains("org.libguestfs.channel.0"));
        assert!(xml.contains(&channel.display().to_string()));
    }

    #[test]
    fn max_disks_reserves_appliance_slot() {
        let backend = DelegatedBackend::new(PathBuf::from("/tmp/control.sock"));
        assert!(backend.max_disks() < 255);
    }
}
