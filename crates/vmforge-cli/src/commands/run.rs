//! The `run` command - launches an appliance, pings the guest daemon
//! once, then shuts down.

use clap::Args;
use std::path::PathBuf;

use vmforge::Handle;
use vmforge_protocol::{PingArgs, PingResult, PROC_PING};

#[derive(Args)]
pub struct RunArgs {
    /// Colon-separated appliance search path
    #[arg(long)]
    search_path: Option<String>,

    /// Hypervisor binary to use instead of the `PATH` lookup
    #[arg(long)]
    hypervisor: Option<PathBuf>,

    /// Backend selector, e.g. "direct" or "delegated:/run/vzd.sock"
    #[arg(long, default_value = "direct")]
    backend: String,

    /// Enable the virtual NIC
    #[arg(long)]
    network: bool,
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut handle = Handle::new();
    {
        let config = handle.config_mut()?;
        if let Some(search_path) = &args.search_path {
            config.search_path = search_path.split(':').map(PathBuf::from).collect();
        }
        config.hypervisor_binary = args.hypervisor.clone();
        config.backend = vmforge_core::config::BackendSelector::parse(&args.backend);
        config.enable_network = args.network;
    }

    handle.launch().await?;
    println!("appliance ready (handle id {})", handle.id());

    let reply: PingResult = handle
        .call(PROC_PING, 0, PingArgs { nonce: 42 })
        .await?;
    println!("ping reply: nonce={}", reply.nonce);

    handle.shutdown(true).await?;
    handle.close().await;
    Ok(())
}
