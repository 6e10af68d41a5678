//! PyCamLights: RGB fixture and camera over HTTP

use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;
use pycamlights::context::DeviceContext;
use pycamlights::server::{self, AppState};
use pycamlights::Config;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Serve an RGB light fixture and camera over HTTP")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// HTTP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Run without the camera (synthetic images)
    #[arg(long)]
    no_camera: bool,

    /// Run without the PWM controller (light writes are no-ops)
    #[arg(long)]
    no_pwm: bool,

    /// Seconds to keep streaming after the last viewer leaves
    #[arg(long)]
    grace_secs: Option<u64>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(bind) = &self.bind {
            config.server.bind_address = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.no_camera {
            config.hardware.camera = false;
        }
        if self.no_pwm {
            config.hardware.pwm = false;
        }
        if let Some(secs) = self.grace_secs {
            config.stream.grace_period_ms = secs.saturating_mul(1000);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pycamlights=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("PyCamLights launching...");

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    let devices = DeviceContext::open(&config.hardware, &config.lights);
    let state = AppState::new(&config, devices)?;
    let camera = state.camera.clone();

    server::serve(&config.server, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    })
    .await?;

    if let Err(e) = camera.shutdown().await {
        error!("Camera shutdown failed: {e}");
    }

    info!("PyCamLights shutting down");
    Ok(())
}
