//! A3S Build CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use a3s_build_cli::commands::{dispatch, Cli};
use a3s_build_runtime::{run_chroot_helper, CHROOT_HELPER_COMMAND};

fn init_tracing(cli: &Cli) {
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() {
    // The chroot helper must run single-threaded, before any runtime starts.
    if std::env::args().nth(1).as_deref() == Some(CHROOT_HELPER_COMMAND) {
        let code = match run_chroot_helper() {
            Ok(code) => code,
            Err(e) => {
                eprintln!("Error: {e}");
                1
            }
        };
        std::process::exit(code);
    }

    let cli = Cli::parse();
    init_tracing(&cli);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: starting async runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(dispatch(cli)) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
