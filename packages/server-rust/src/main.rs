use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use arena_core::WorkerKind;
use arena_server::config::ConfigPaths;
use arena_server::logging::{self, LogFormat};
use arena_server::network::{parse_port_arg, HttpSocketLayer};
use arena_server::{pool, App, BootOptions};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "arena-server", version, about = "Arena server process supervisor")]
struct Cli {
    /// Port to listen on. Leading digits are used; anything unusable falls
    /// back to the configured port.
    port: Option<String>,

    /// Live config file.
    #[arg(long, env = "ARENA_CONFIG", default_value = "config/config.json")]
    config: PathBuf,

    /// Template copied to the live config path on first boot.
    #[arg(long, default_value = "config/config-example.json")]
    config_template: PathBuf,

    /// Run as a pool worker of this kind, serving tasks on stdio.
    #[arg(long, value_name = "KIND")]
    worker: Option<WorkerKind>,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format)?;

    if let Some(kind) = cli.worker {
        return pool::serve_stdio(kind).await;
    }

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("installing metrics recorder")?;

    let options = BootOptions::for_process(ConfigPaths::new(cli.config, cli.config_template))?;
    let app = App::boot(options).await?;
    let ctx = app.context();

    let layer = HttpSocketLayer::new(
        Arc::clone(&ctx.config),
        Arc::clone(&ctx.lockdown),
        Some(metrics),
    );
    let addr = app
        .listen(&layer, parse_port_arg(cli.port.as_deref()), None, None)
        .await?;
    app.finish_boot().await?;
    info!(%addr, "arena server ready");

    let mut stopped = ctx.lockdown.shutdown_receiver();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listening for ctrl-c")?;
            info!("interrupt received; shutting down");
        }
        _ = stopped.wait_for(|stop| *stop) => {
            info!("lockdown drained; shutting down");
        }
    }

    app.shutdown(false).await;
    Ok(())
}
