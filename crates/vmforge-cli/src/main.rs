mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "vmforge")]
#[command(about = "Launch and drive vmforge appliances")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch an appliance and run one diagnostic RPC against it
    Run(commands::run::RunArgs),

    /// List the registered launch backends
    Backends(commands::backends::BackendsArgs),

    /// Show version information
    Version(commands::version::VersionArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => commands::run::run(args).await?,
        Commands::Backends(args) => commands::backends::run(args),
        Commands::Version(args) => commands::version::run(args),
    }

    Ok(())
}
