use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_settings, Delivery, MlsDecryptionGateway, NotificationPipeline, NotificationSink,
    OpenMlsContextProvider,
};
use tokio::io::AsyncReadExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Plays the notification-extension host: decrypts one push payload under the
/// extension deadline and prints the single resulting delivery as JSON.
#[derive(Parser, Debug)]
struct Args {
    /// Push payload file, or `-` for stdin.
    #[arg(long, default_value = "-")]
    payload: String,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the configured data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

struct StdoutSink;

impl NotificationSink for StdoutSink {
    fn deliver(&self, delivery: Delivery) {
        match serde_json::to_string(&delivery) {
            Ok(json) => println!("{json}"),
            Err(e) => error!("notify: failed to encode delivery: {e}"),
        }
    }
}

async fn read_payload(source: &str) -> Result<Vec<u8>> {
    if source == "-" {
        let mut raw = Vec::new();
        tokio::io::stdin()
            .read_to_end(&mut raw)
            .await
            .context("failed to read payload from stdin")?;
        return Ok(raw);
    }
    tokio::fs::read(source)
        .await
        .with_context(|| format!("failed to read payload file '{source}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref());
    if let Some(data_dir) = args.data_dir {
        settings.data_dir = data_dir;
    }
    info!(
        "notify: data_dir={} deadline={:?}",
        settings.data_dir.display(),
        settings.notification_deadline()
    );

    let raw = read_payload(&args.payload).await?;
    let provider = OpenMlsContextProvider::new(settings.group_config());
    let gateway = MlsDecryptionGateway::new(&settings, Arc::new(provider))
        .with_holder("notification-extension");
    let pipeline = NotificationPipeline::new(Arc::new(gateway), &settings);
    let delivery = pipeline.run(&raw, Arc::new(StdoutSink)).await;
    info!(
        "notify: finished with {}",
        match &delivery {
            Delivery::Show(content) if content.decrypted => "decrypted notification",
            Delivery::Show(_) => "fallback notification",
            Delivery::Suppress => "suppressed self-send",
        }
    );
    Ok(())
}
