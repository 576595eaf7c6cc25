//! The `backends` command - lists the two registered launch backends.

use clap::Args;

#[derive(Args)]
pub struct BackendsArgs {}

pub fn run(_args: BackendsArgs) {
    for (name, description) in [
        ("direct", "forks the hypervisor in this process"),
        ("delegated", "asks an external virtualization daemon to start the VM"),
    ] {
        println!("{name}: {description}");
    }
}
