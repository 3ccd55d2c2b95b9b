// dcppd: Direct Connect engine daemon. Hubs, shares and ports come from config.toml.

use std::path::PathBuf;

use anyhow::Context as _;
use dc_server::{config, Engine};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("dcppd {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = match config_path {
        Some(path) => {
            let mut c = config::load_path(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            c.apply_env(|k| std::env::var(k).ok());
            c
        }
        None => config::load(),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let engine = Engine::startup(cfg, |step| tracing::info!("{step}")).await?;
        tracing::info!(version = VERSION, port = engine.config().tcp_port, "dcppd running");
        let waited = shutdown_signal().await;
        engine.shutdown().await;
        waited
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
