//! Resona renderer daemon
//!
//! Discovers the sink, starts the audio core and control tasks, then waits
//! for control points. The sink transport is selected here: the in-process
//! loopback target ships by default; a proprietary transport links in by
//! implementing `sink::SinkTransport` and constructing it in its place.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use resona::sink::loopback::LoopbackSink;
use resona::sink::SinkTransport;
use resona::{Renderer, RendererConfig};

/// Resona - networked audio renderer for synchronous LAN audio sinks
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Renderer name announced to control points
    #[arg(short, long, default_value = "Resona Renderer")]
    name: String,

    /// Device UUID (default: generated)
    #[arg(long)]
    uuid: Option<uuid::Uuid>,

    /// Select sink target by index (1, 2, 3...)
    #[arg(short, long, value_name = "N", default_value_t = 1)]
    target: usize,

    /// Network interface to bind (e.g. eth0)
    #[arg(long, value_name = "NAME")]
    interface: Option<String>,

    /// List reachable sink targets and exit
    #[arg(short, long)]
    list_targets: bool,

    /// Disable gapless track transitions
    #[arg(long)]
    no_gapless: bool,

    /// MTU override (skips path-MTU measurement)
    #[arg(long, value_name = "BYTES")]
    mtu: Option<u32>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn list_targets(transport: &mut dyn SinkTransport) -> anyhow::Result<()> {
    let targets = transport.discover()?;
    if targets.is_empty() {
        println!("No sink targets found");
        return Ok(());
    }
    println!("\nAvailable sink targets ({} found):\n", targets.len());
    for (i, target) in targets.iter().enumerate() {
        println!("[{}] {}", i + 1, target.name);
        if let Some(output) = &target.output_name {
            println!("    Output: {output}");
        }
        println!("    Version: {}", target.version);
        println!("    ProductID: {:#06x}\n", target.product_id);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("resona={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (mut sink, _handle) = LoopbackSink::new(true);

    if args.list_targets {
        return match list_targets(&mut sink) {
            Ok(()) => std::process::ExitCode::SUCCESS,
            Err(e) => {
                error!("target listing failed: {e}");
                std::process::ExitCode::FAILURE
            }
        };
    }

    if args.target == 0 {
        error!("target index must be >= 1");
        return std::process::ExitCode::FAILURE;
    }

    let config = RendererConfig {
        name: args.name,
        uuid: args.uuid.unwrap_or_else(uuid::Uuid::new_v4),
        target_index: args.target - 1,
        interface: args.interface,
        mtu_override: args.mtu,
        gapless: !args.no_gapless,
        ..RendererConfig::default()
    };

    info!(name = %config.name, uuid = %config.uuid, "starting renderer");
    if let Some(interface) = &config.interface {
        info!(%interface, "binding network interface");
    }

    let mut renderer = Renderer::new(Box::new(sink), config);
    if let Err(e) = renderer.start().await {
        error!("failed to start renderer: {e}");
        return std::process::ExitCode::FAILURE;
    }

    info!("renderer running, waiting for control points (Ctrl+C to stop)");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("signal handler failed: {e}");
    }

    info!("shutting down");
    renderer.stop().await;
    std::process::ExitCode::SUCCESS
}
