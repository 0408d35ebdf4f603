//! Structured logging setup
//!
//! The library only emits `tracing` events: graph compilation at `info`,
//! fusion decisions at `debug`, per-step progress at `trace` and step
//! failures at `error`. Arena sizing in `strata_core` logs at `debug`.
//! Binaries install a subscriber with [`init_tracing`], available with the
//! `subscriber` feature.
//!
//! # Example
//!
//! ```ignore
//! use strata_ad::logging::{init_tracing, TracingConfig, TracingFormat};
//!
//! // Compact lines, plus one event per training step
//! init_tracing(TracingConfig::default().format(TracingFormat::Compact).step_events(true))?;
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: full filter directive, overrides the configured levels
//! - `STRATA_LOG_FORMAT`: `json`, `compact` or `pretty` (default)

use anyhow::Result;
use serde::{Deserialize, Serialize};
#[cfg(feature = "subscriber")]
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Tracing output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TracingFormat {
    /// Multi-line human-readable events
    Pretty,
    /// One JSON object per event
    Json,
    /// One line per event
    Compact,
}

impl TracingFormat {
    /// Parse a format name, falling back to `Pretty`
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => TracingFormat::Json,
            "compact" => TracingFormat::Compact,
            _ => TracingFormat::Pretty,
        }
    }
}

/// Subscriber configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracingConfig {
    pub format: TracingFormat,
    /// Level for graph building, compilation and sessions
    pub graph_level: String,
    /// Level for the memory arena
    pub arena_level: String,
    /// Emit the per-step `trace` events of the session
    pub step_events: bool,
    /// Explicit directive that replaces the levels above (from `RUST_LOG`)
    pub directive: Option<String>,
    pub with_ansi: bool,
    /// Show source file and line of each event
    pub with_file: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        let format = std::env::var("STRATA_LOG_FORMAT")
            .map(|s| TracingFormat::parse(&s))
            .unwrap_or(TracingFormat::Pretty);

        Self {
            format,
            graph_level: "info".to_string(),
            arena_level: "warn".to_string(),
            step_events: false,
            directive: std::env::var("RUST_LOG").ok().filter(|d| !d.trim().is_empty()),
            with_ansi: true,
            with_file: false,
        }
    }
}

impl TracingConfig {
    pub fn format(mut self, format: TracingFormat) -> Self {
        self.format = format;
        self
    }

    pub fn graph_level(mut self, level: impl Into<String>) -> Self {
        self.graph_level = level.into();
        self
    }

    pub fn arena_level(mut self, level: impl Into<String>) -> Self {
        self.arena_level = level.into();
        self
    }

    pub fn step_events(mut self, enabled: bool) -> Self {
        self.step_events = enabled;
        self
    }

    /// Replace the per-crate levels with a raw filter directive
    pub fn directive(mut self, directive: impl Into<String>) -> Self {
        self.directive = Some(directive.into());
        self
    }

    pub fn ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    /// Filter directive the subscriber is built from
    pub fn filter_directive(&self) -> String {
        if let Some(directive) = &self.directive {
            return directive.clone();
        }
        let mut directive = format!(
            "warn,strata_ad={},strata_core={}",
            self.graph_level, self.arena_level
        );
        if self.step_events {
            directive.push_str(",strata_ad::scheduler=trace");
        }
        directive
    }
}

/// Install a global subscriber for the given configuration
///
/// Call once at startup. Fails if the directive does not parse or a global
/// subscriber is already set.
#[cfg(feature = "subscriber")]
pub fn init_tracing(config: TracingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(config.filter_directive())?;
    let base = fmt::layer()
        .with_ansi(config.with_ansi && config.format != TracingFormat::Json)
        .with_file(config.with_file)
        .with_line_number(config.with_file);

    let layer = match config.format {
        TracingFormat::Pretty => base.pretty().with_filter(filter).boxed(),
        TracingFormat::Json => base.json().with_filter(filter).boxed(),
        TracingFormat::Compact => base.compact().with_filter(filter).boxed(),
    };
    tracing_subscriber::registry().with(layer).try_init()?;
    Ok(())
}

/// Without the `subscriber` feature events go to whatever subscriber the
/// application installed, if any
#[cfg(not(feature = "subscriber"))]
pub fn init_tracing(_config: TracingConfig) -> Result<()> {
    Ok(())
}
