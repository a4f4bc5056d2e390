//! Entrypoint of the EIDA federation services binary.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

mod commands {
    pub mod error;
    pub mod harvest;
    pub mod resolver;
    pub mod serve;
}

use commands::error::ReturnCode;
use commands::{harvest, resolver, serve};

#[derive(Debug, Parser)]
#[clap(
    name = "eidafedd",
    version,
    about = "EIDA federation services: federator, routing resolver and catalog harvester"
)]
struct Cli {
    /// Log filter directive, e.g. "info" or "eidafedd=debug,info".
    #[clap(long = "log-filter", env = "EIDAFEDD_LOG_FILTER", default_value = "info")]
    log_filter: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the federator server.
    Serve(serve::Config),

    /// Run the routing resolver server.
    Resolver(resolver::Config),

    /// Harvest the routing catalog from the upstream data centers.
    Harvest(harvest::Config),
}

fn main() {
    let cli = Cli::parse();

    let filter = match EnvFilter::try_new(&cli.log_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("invalid log filter {:?}: {e}", cli.log_filter);
            std::process::exit(ReturnCode::ConfigError as i32);
        }
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("cannot start the async runtime: {e}");
            std::process::exit(ReturnCode::IoError as i32);
        }
    };

    let code = runtime.block_on(async move {
        let result = match cli.command {
            Command::Serve(config) => serve::command(config).await,
            Command::Resolver(config) => resolver::command(config).await,
            Command::Harvest(config) => harvest::command(config).await,
        };
        match result {
            Ok(()) => ReturnCode::Success,
            Err(e) => {
                error!(error = %e, "command failed");
                e.return_code()
            }
        }
    });

    std::process::exit(code as i32);
}
