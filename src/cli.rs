//! Command line interface for the muxframe demo server.
//!
//! Provides the flags consumed by `main` and drives man page generation.

use std::{net::SocketAddr, time::Duration};

use clap::Parser;

/// Command line arguments for the `muxframe` binary.
#[derive(Debug, Parser)]
#[command(
    name = "muxframe",
    version,
    about = "Multiplexed echo server with graceful shutdown"
)]
pub struct Cli {
    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:7878")]
    pub bind: SocketAddr,

    /// Time in-flight streams may run after shutdown is requested.
    #[arg(long, default_value_t = 30_000)]
    pub grace_period_ms: u64,

    /// Maximum concurrently open streams per connection.
    #[arg(long, default_value_t = 100)]
    pub max_concurrent_streams: usize,

    /// Number of accept workers. Defaults to the number of CPUs.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Serve Prometheus metrics on this address.
    #[cfg(feature = "metrics")]
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
}

impl Cli {
    /// Grace period as a [`Duration`].
    #[must_use]
    pub fn grace_period(&self) -> Duration { Duration::from_millis(self.grace_period_ms) }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;

    #[test]
    fn defaults_are_applied() {
        let cli = Cli::parse_from(["muxframe"]);
        assert_eq!(cli.bind.port(), 7878);
        assert_eq!(cli.grace_period_ms, 30_000);
        assert_eq!(cli.max_concurrent_streams, 100);
        assert!(cli.workers.is_none());
    }

    #[test]
    fn parses_shutdown_options() {
        let cli = Cli::parse_from([
            "muxframe",
            "--bind",
            "0.0.0.0:9000",
            "--grace-period-ms",
            "250",
            "--workers",
            "2",
        ]);
        assert_eq!(cli.bind.port(), 9000);
        assert_eq!(cli.grace_period().as_millis(), 250);
        assert_eq!(cli.workers, Some(2));
    }
}
