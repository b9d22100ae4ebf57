//! Tracing setup
//!
//! `RUST_LOG` wins over the configured filter. With a log directory, a
//! daily-rolling file layer is added next to stdout; keep the returned guard
//! alive for the life of the process so buffered lines get flushed.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

pub const DEFAULT_LOG_FILTER: &str = "endpoint_evolution=info,tower_http=info";

pub fn init_tracing(filter: Option<&str>, log_dir: Option<&str>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter.unwrap_or(DEFAULT_LOG_FILTER)))?;

    let stdout = tracing_subscriber::fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "endpoint_evolution.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            Registry::default()
                .with(filter)
                .with(stdout)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .try_init()?;
            Ok(Some(guard))
        }
        None => {
            Registry::default().with(filter).with(stdout).try_init()?;
            Ok(None)
        }
    }
}
