//! Demo binary running a multiplexed echo server.
//!
//! Every stream echoes its request metadata and body. Ctrl+C drains open
//! streams for the configured grace period before the process exits.

mod cli;

use async_trait::async_trait;
use bytes::BytesMut;
use clap::Parser;
use muxframe::{
    config::ConnectionConfig,
    handler::{HandlerError, Request, ResponseWriter, StreamHandler},
    server::MuxServer,
};

/// Echoes each request back on its own stream.
struct Echo;

#[async_trait]
impl StreamHandler for Echo {
    async fn call(
        &self,
        mut request: Request,
        mut response: ResponseWriter,
    ) -> Result<(), HandlerError> {
        response.send_headers(request.metadata().clone(), false)?;
        let mut body = BytesMut::new();
        while let Some(chunk) = request.body_mut().chunk().await {
            body.extend_from_slice(&chunk);
        }
        response.send_data(body.freeze(), true).await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    let cli = cli::Cli::parse();

    #[cfg(feature = "metrics")]
    if let Some(addr) = cli.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        tracing::info!(%addr, "serving metrics");
    }

    let config = ConnectionConfig::default()
        .with_grace_period(cli.grace_period())
        .with_max_concurrent_streams(cli.max_concurrent_streams);
    let mut server = MuxServer::new(Echo, config);
    if let Some(workers) = cli.workers {
        server = server.workers(workers);
    }
    let server = server.bind(cli.bind)?;
    tracing::info!(addr = ?server.local_addr(), "listening");
    server.run().await?;
    Ok(())
}
