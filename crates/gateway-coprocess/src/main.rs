//! Gateway coprocess host
//!
//! Speaks the framed protocol on stdin/stdout. Logs go to stderr.
//!
//! Bundle directories passed as arguments are loaded before serving.

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateway_coprocess::{host, DispatcherConfig, Dispatcher, DylibLoader};

#[tokio::main]
async fn main() -> Result<()> {
    let config = DispatcherConfig::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_new(&config.log_filter)
            .unwrap_or_else(|_| "info,gateway_coprocess=debug".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting gateway coprocess");
    tracing::debug!("Configuration loaded: {:?}", config);

    let loader = Arc::new(DylibLoader::new());
    let dispatcher = Arc::new(Dispatcher::new(config, loader));

    for path in std::env::args().skip(1) {
        // Failures are logged by the dispatcher
        let _ = dispatcher.load_bundle(&path);
    }

    host::serve(dispatcher, tokio::io::stdin(), tokio::io::stdout()).await?;

    tracing::info!("Gateway coprocess stopped");
    Ok(())
}
