use clap::Parser;
use tracing_subscriber::EnvFilter;

use helical_motion_runtime::runtime::{self, Cli};

fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let cli = Cli::parse();
    if let Err(e) = runtime::run(cli) {
        helical_motion_runtime::abort::restore_terminal();
        eprintln!("Runtime error: {e}");
        std::process::exit(1);
    }
}
