//! Logging setup.

use crate::config::LoggingSettings;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
///
/// The gate and the network core log at the configured level; dependencies
/// are held at `warn` so accept-loop chatter from tokio or socket2 stays out.
fn default_directives(level: &str) -> String {
    format!("warn,game_gate={level},game_net={level}")
}

/// Initializes the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn setup_logging(config: &LoggingSettings) -> anyhow::Result<()> {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default_directives(&config.level));
    let filter = EnvFilter::try_new(&directives)?;

    // Connection logs carry conn_id fields, so thread ids add nothing
    let layer = fmt::layer()
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false);

    let registry = tracing_subscriber::registry().with(filter);
    if config.json_format {
        registry.with(layer.json().flatten_event(true)).try_init()?;
    } else {
        registry.with(layer.with_ansi(true)).try_init()?;
    }

    info!("🔧 Logging initialized ({})", directives);
    Ok(())
}
