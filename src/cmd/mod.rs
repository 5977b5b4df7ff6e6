//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `infra`  | `Infra`          |
//! | `config` | `Config`         |

pub mod config;
pub mod infra;
pub mod serve;

pub use config::cmd_config;
pub use infra::cmd_infra;
pub use serve::cmd_serve;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use shipyard::config::ShipyardConfig;

use super::LogFormat;

const DEFAULT_FILTER: &str = "shipyard=info,tower_http=info";

/// Install the global subscriber. The returned guard flushes the log file
/// on drop and must live until exit.
pub fn init_tracing(format: LogFormat, config: &ShipyardConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let console = if format == LogFormat::Json || config.logging.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };

    let (file, guard) = match &config.logging.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "shipyard.log"));
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to initialize logging")?;
    Ok(guard)
}
