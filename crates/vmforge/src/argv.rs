//! Hypervisor argument builder (C5): composes a validated argv from
//! probed capabilities, drives and launch configuration.
//!
//! Runs entirely before fork — the child side of the eventual exec is
//! signal-safe only, so all fallible string work (URI formatting,
//! capability lookups) happens here in the parent.

use std::ffi::OsString;
use std::path::Path;

use vmforge_core::capabilities::HypervisorCapabilities;
use vmforge_core::config::{BackendSettings, HandleConfig, VIRTUAL_NIC_SUBNET};
use vmforge_core::drive::Drive;
use vmforge_core::error::{Error, Result};

use crate::drives::DriveVector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accelerator {
    KvmOnly,
    TcgOnly,
    KvmThenTcg,
}

/// UEFI firmware paths, when booting via UEFI rather than direct kernel
/// boot.
#[derive(Debug, Clone)]
pub struct UefiFirmware {
    pub code: std::path::PathBuf,
    pub vars: std::path::PathBuf,
}

/// Everything the builder needs that isn't already on [`HandleConfig`]
/// or the drive vector.
pub struct BuildContext<'a> {
    pub config: &'a HandleConfig,
    pub capabilities: &'a HypervisorCapabilities,
    pub drives: &'a DriveVector,
    pub appliance_overlay: &'a Path,
    pub kernel: &'a Path,
    pub initrd: &'a Path,
    pub uefi: Option<&'a UefiFirmware>,
    pub force_kvm: bool,
    pub force_tcg: bool,
    pub cpu_model: &'a str,
    pub machine_type: &'a str,
    /// Host-side path of the console's listening Unix socket; the
    /// hypervisor connects to it as a chardev client.
    pub console_socket: &'a Path,
    /// Host-side path of the request/response channel's listening Unix
    /// socket, backing the `org.libguestfs.channel.0` virtserialport.
    pub rpc_socket: &'a Path,
}

fn resolve_accelerator(ctx: &BuildContext, kvm_available: bool) -> Result<Accelerator> {
    if ctx.force_kvm && ctx.force_tcg {
        return Err(Error::InvalidConfig(
            "cannot force both KVM and TCG acceleration".to_string(),
        ));
    }
    if ctx.force_kvm {
        if !kvm_available {
            return Err(Error::InvalidConfig(
                "KVM acceleration forced but unavailable on this host".to_string(),
            ));
        }
        return Ok(Accelerator::KvmOnly);
    }
    if ctx.force_tcg {
        return Ok(Accelerator::TcgOnly);
    }
    Ok(Accelerator::KvmThenTcg)
}

fn accelerator_arg(accel: Accelerator) -> &'static str {
    match accel {
        Accelerator::KvmOnly => "kvm",
        Accelerator::TcgOnly => "tcg",
        Accelerator::KvmThenTcg => "kvm:tcg",
    }
}

/// Adds `flag` and `value` only if the probe's help text says the
/// hypervisor accepts it. Used for options known to have been
/// introduced in a later version.
fn add_if_supported(args: &mut Vec<OsString>, caps: &HypervisorCapabilities, flag: &str, value: Option<&str>) {
    if caps.accepts_option(flag) {
        args.push(flag.into());
        if let Some(value) = value {
            args.push(value.into());
        }
    }
}

fn push_drive_arg(args: &mut Vec<OsString>, index: usize, drive: &Drive) -> Result<()> {
    let uri = drive.format_uri()?;
    let mut spec = format!("file={uri},if=virtio,index={index}");
    if let Some(format) = &drive.options.format {
        spec.push_str(&format!(",format={format}"));
    }
    if drive.is_readonly() {
        spec.push_str(",readonly=on");
    }
    if let Some(cache) = &drive.options.cache_mode {
        spec.push_str(&format!(",cache={cache}"));
    }
    if drive.options.copy_on_read {
        spec.push_str(",copy-on-read=on");
    }
    if let Some(discard) = drive.effective_discard()? {
        let _ = discard;
        spec.push_str(",discard=unmap");
    }
    args.push("-drive".into());
    args.push(spec.into());
    Ok(())
}

/// Builds the full hypervisor argv. `opaque_params` is the caller-
/// supplied `(flag, value)` list, always appended last so it can
/// override anything the builder itself composed.
pub fn build_argv(ctx: &BuildContext, opaque_params: &[(String, Option<String>)]) -> Result<Vec<OsString>> {
    let mut args = Vec::new();
    let accel = resolve_accelerator(ctx, ctx.capabilities.kvm_enabled)?;

    args.push("-machine".into());
    args.push(ctx.machine_type.into());
    args.push("-accel".into());
    args.push(accelerator_arg(accel).into());
    args.push("-cpu".into());
    args.push(ctx.cpu_model.into());
    args.push("-m".into());
    args.push(format!("{}M", ctx.config.memsize_mib).into());
    args.push("-smp".into());
    args.push(ctx.config.smp.to_string().into());
    args.push("-rtc".into());
    args.push("base=utc,driftfix=slew".into());
    args.push("-no-reboot".into());

    #[cfg(target_arch = "x86_64")]
    add_if_supported(&mut args, ctx.capabilities, "-no-hpet", None);

    args.push("-kernel".into());
    args.push(ctx.kernel.as_os_str().to_owned());
    args.push("-initrd".into());
    args.push(ctx.initrd.as_os_str().to_owned());

    if let Some(append) = &ctx.config.append {
        args.push("-append".into());
        args.push(append.into());
    }

    if let Some(uefi) = ctx.uefi {
        args.push("-drive".into());
        args.push(format!("if=pflash,format=raw,readonly=on,file={}", uefi.code.display()).into());
        args.push("-drive".into());
        args.push(format!("if=pflash,format=raw,file={}", uefi.vars.display()).into());
    }

    args.push("-object".into());
    args.push("rng-random,id=rng0,filename=/dev/urandom".into());
    args.push("-device".into());
    args.push("virtio-rng-pci,rng=rng0".into());

    args.push("-device".into());
    args.push("virtio-scsi-pci,id=scsi0".into());

    for (index, drive) in ctx.drives.iter() {
        push_drive_arg(&mut args, index, drive)?;
    }

    args.push("-drive".into());
    args.push(
        format!(
            "file={},if=virtio,format=qcow2,snapshot=on",
            ctx.appliance_overlay.display()
        )
        .into(),
    );

    args.push("-chardev".into());
    args.push(format!("socket,id=channel0,path={}", ctx.rpc_socket.display()).into());
    args.push("-device".into());
    args.push("virtio-serial".into());
    args.push("-device".into());
    args.push("virtserialport,chardev=channel0,name=org.libguestfs.channel.0".into());

    args.push("-chardev".into());
    args.push(format!("socket,id=console0,path={}", ctx.console_socket.display()).into());
    args.push("-serial".into());
    args.push("chardev:console0".into());

    if ctx.config.enable_network {
        args.push("-netdev".into());
        args.push(format!("user,id=net0,net={VIRTUAL_NIC_SUBNET}").into());
        args.push("-device".into());
        args.push("virtio-net-pci,netdev=net0".into());
    }

    for (flag, value) in opaque_params {
        args.push(flag.clone().into());
        if let Some(value) = value {
            args.push(value.clone().into());
        }
    }

    Ok(args)
}

/// Converts a handle's ordered `BackendSettings` into the opaque
/// `(flag, value)` pairs `build_argv` appends last.
pub fn backend_settings_to_opaque_params(settings: &BackendSettings) -> Vec<(String, Option<String>)> {
    settings
        .iter()
        .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
        .collect()
}
