use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use weather_fusion::aggregate::{Aggregator, FusionConfig};
use weather_fusion::cli;
use weather_fusion::collectors::build_sources;
use weather_fusion::config::Config;
use weather_fusion::source::{handler, WeatherSource};

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,weather_fusion=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    init_tracing()?;

    let config = Config::from_env(args.config.clone()).context("failed to load config")?;
    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let fusion = FusionConfig::from_config(&config.sources.aggregate)
        .context("invalid aggregate config")?;
    let aggregate = Arc::new(Aggregator::new(fusion));
    let sources = build_sources(&config.sources).context("failed to build sources")?;
    if sources.is_empty() {
        tracing::warn!(path = %config.config_path.display(), "no sources enabled");
    }
    for source in sources {
        let child = aggregate.add_source(source.clone());
        tracing::info!(child = %child, source = %source.name(), "source registered");
    }

    aggregate.subscribe(handler(|fused| {
        let json = serde_json::to_string(fused.as_ref())?;
        tracing::info!(status = %json, "fused weather");
        Ok(())
    }));

    let cancel = CancellationToken::new();
    let listen_cancel = cancel.clone();
    let listener = aggregate.clone();
    let mut listen_handle = tokio::spawn(async move { listener.listen(listen_cancel).await });

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            None
        }
        joined = &mut listen_handle => Some(joined),
    };

    let joined = match finished {
        Some(joined) => joined,
        None => {
            cancel.cancel();
            listen_handle.await
        }
    };
    joined
        .context("aggregate task panicked")?
        .context("aggregate stopped with an error")?;
    tracing::info!("weather-fusion stopped");
    Ok(())
}
