use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALISED: OnceLock<()> = OnceLock::new();
static CHROME_GUARD: OnceLock<Mutex<Option<tracing_chrome::FlushGuard>>> = OnceLock::new();

/// Knobs for the global subscriber. `RUST_LOG` always takes precedence over
/// `default_filter`.
#[derive(Clone, Debug)]
pub struct TracingOptions {
    pub default_filter: String,
    pub with_target: bool,
    /// Chrome trace output; defaults to `SPIRAL_TRACE_CHROME` when unset.
    pub chrome_path: Option<PathBuf>,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            with_target: true,
            chrome_path: None,
        }
    }
}

impl TracingOptions {
    /// Uses `filter` when `RUST_LOG` is not set.
    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }
}

/// Configures the global tracing subscriber.
pub fn init_tracing_with(options: TracingOptions) -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;

    let ansi = std::io::stdout().is_terminal();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.default_filter))
        .map_err(|err| InitError::Filter(err.to_string()))?;
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(options.with_target)
        .with_ansi(ansi);

    let chrome_path = match options.chrome_path {
        Some(path) => Some(path),
        None => chrome_trace_path()?,
    };

    match chrome_path {
        Some(path) => {
            let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
                .file(path)
                .include_args(true)
                .build();
            let cell = CHROME_GUARD.get_or_init(|| Mutex::new(None));
            if let Ok(mut slot) = cell.lock() {
                *slot = Some(guard);
            }
            Registry::default()
                .with(filter)
                .with(fmt_layer)
                .with(chrome_layer)
                .init();
        }
        None => {
            Registry::default().with(filter).with(fmt_layer).init();
        }
    }

    Ok(())
}

/// Flushes and drops the chrome trace writer, if one was installed.
pub fn flush_chrome_trace() {
    if let Some(cell) = CHROME_GUARD.get() {
        if let Ok(mut slot) = cell.lock() {
            slot.take();
        }
    }
}

fn chrome_trace_path() -> Result<Option<PathBuf>, InitError> {
    match std::env::var("SPIRAL_TRACE_CHROME") {
        Ok(raw) if !raw.trim().is_empty() => Ok(Some(PathBuf::from(raw))),
        Ok(_) => Ok(None),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(InitError::Env(err)),
    }
}

/// Errors emitted when configuring the tracing subscriber.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
    #[error("failed to read SPIRAL_TRACE_CHROME: {0}")]
    Env(std::env::VarError),
    #[error("invalid tracing filter: {0}")]
    Filter(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_override_default_filter() {
        let options = TracingOptions::default().with_default_filter("st_tta=debug");
        assert_eq!(options.default_filter, "st_tta=debug");
        assert!(options.with_target);
        assert!(options.chrome_path.is_none());
    }
}
