//! CLI config shared by the server driver programs.

use std::net::SocketAddr;
use std::num::ParseIntError;
use std::time::Duration;

/// CLI config shared by the server driver programs.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct RunConfig {
    /// The address on which the HTTP server listens.
    #[clap(
        long = "bind",
        env = "EIDAFEDD_BIND_ADDR",
        default_value = "127.0.0.1:8080",
        action
    )]
    pub bind_address: SocketAddr,

    /// On a graceful-shutdown signal, in-flight jobs are drained for at
    /// most this many seconds before the process exits.
    #[clap(
        long = "shutdown-deadline-seconds",
        env = "EIDAFEDD_SHUTDOWN_DEADLINE_SECONDS",
        default_value = "30",
        value_parser = parse_duration
    )]
    pub shutdown_deadline: Duration,
}

/// Map a string containing an integer number of seconds into a
/// [`Duration`].
pub(crate) fn parse_duration(input: &str) -> Result<Duration, ParseIntError> {
    input.parse().map(Duration::from_secs)
}
