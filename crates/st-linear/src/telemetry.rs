// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Process-wide log subscriber for binaries, benches and tests.
//!
//! Forward and backward calls emit `st.linear.*` spans. The subscriber prints
//! them to stderr and can also record them as a Chrome trace.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_chrome::{ChromeLayerBuilder, FlushGuard};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

const DEFAULT_FILTER: &str = "info";

/// `None` until a subscriber is installed; `Some(guard)` while a Chrome trace is open.
static INSTALLED: Mutex<Option<Option<FlushGuard>>> = Mutex::new(None);

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("a log subscriber is already installed")]
    AlreadyInstalled,
    #[error("log subscriber rejected: {0}")]
    Subscriber(String),
}

/// Subscriber settings resolved from `RUST_LOG` and `SPIRAL_TRACE_CHROME`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSettings {
    pub filter: String,
    pub chrome_file: Option<PathBuf>,
    pub ansi: bool,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            chrome_file: None,
            ansi: std::io::stderr().is_terminal(),
        }
    }
}

impl TraceSettings {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Blank values fall back to the defaults.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let present = |key: &str| lookup(key).filter(|raw| !raw.trim().is_empty());
        let defaults = Self::default();
        Self {
            filter: present(EnvFilter::DEFAULT_ENV).unwrap_or(defaults.filter),
            chrome_file: present("SPIRAL_TRACE_CHROME").map(PathBuf::from),
            ansi: defaults.ansi,
        }
    }
}

/// Installs the subscriber described by [`TraceSettings::from_env`].
pub fn init_tracing() -> Result<(), TelemetryError> {
    init_tracing_with(TraceSettings::from_env())
}

/// Installs an `EnvFilter` + stderr fmt subscriber, plus a Chrome trace
/// layer when `settings.chrome_file` is set.
pub fn init_tracing_with(settings: TraceSettings) -> Result<(), TelemetryError> {
    let mut installed = INSTALLED
        .lock()
        .map_err(|_| TelemetryError::Subscriber("subscriber state poisoned".into()))?;
    if installed.is_some() {
        return Err(TelemetryError::AlreadyInstalled);
    }

    let filter = EnvFilter::try_new(&settings.filter)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(settings.ansi)
        .with_writer(std::io::stderr);
    let (chrome, guard) = match settings.chrome_file {
        Some(path) => {
            let (layer, guard) = ChromeLayerBuilder::new()
                .file(path)
                .include_args(true)
                .build();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(filter)
        .with(stderr)
        .with(chrome)
        .try_init()
        .map_err(|err| TelemetryError::Subscriber(err.to_string()))?;
    *installed = Some(guard);
    Ok(())
}

/// Idempotent [`init_tracing`]; other failures are logged rather than returned.
pub fn ensure_tracing() {
    match init_tracing() {
        Ok(()) | Err(TelemetryError::AlreadyInstalled) => {}
        Err(err) => tracing::warn!("log subscriber not installed: {err}"),
    }
}

/// Writes out and closes the Chrome trace file, if one is open.
pub fn flush_chrome_trace() {
    if let Ok(mut installed) = INSTALLED.lock() {
        if let Some(guard) = installed.as_mut() {
            guard.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_read_filter_and_chrome_file() {
        let settings = TraceSettings::from_vars(|key| match key {
            "RUST_LOG" => Some("st_linear=debug".into()),
            "SPIRAL_TRACE_CHROME" => Some("trace.json".into()),
            _ => None,
        });
        assert_eq!(settings.filter, "st_linear=debug");
        assert_eq!(settings.chrome_file, Some(PathBuf::from("trace.json")));

        let blank = TraceSettings::from_vars(|_| Some("  ".into()));
        assert_eq!(blank.filter, DEFAULT_FILTER);
        assert_eq!(blank.chrome_file, None);
    }

    #[test]
    fn second_installation_is_reported() {
        ensure_tracing();
        assert!(matches!(
            init_tracing_with(TraceSettings::default()),
            Err(TelemetryError::AlreadyInstalled)
        ));
        ensure_tracing();
        flush_chrome_trace();
    }
}
