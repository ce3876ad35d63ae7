/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file logger.rs
 * @brief Compact tracing output with pid and timestamp
 */

use crate::error::{HybridError, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use tracing::{Level, Subscriber};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            LogLevel::Debug => "•",
            LogLevel::Info => "✓",
            LogLevel::Warning => "⚠",
            LogLevel::Error => "✗",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO "),
            LogLevel::Warning => write!(f, "WARN "),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl From<Level> for LogLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::TRACE | Level::DEBUG => LogLevel::Debug,
            Level::INFO => LogLevel::Info,
            Level::WARN => LogLevel::Warning,
            Level::ERROR => LogLevel::Error,
        }
    }
}

impl FromStr for LogLevel {
    type Err = HybridError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" | "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(HybridError::Configuration(format!("Unknown log level: {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub pid: u32,
    pub message: String,
    pub target: String,
    pub line: Option<u32>,
}

impl LogEvent {
    pub fn new(level: LogLevel, target: &str, message: String) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            pid: std::process::id(),
            message,
            target: target.to_string(),
            line: None,
        }
    }

    pub fn format_compact(&self) -> String {
        format!(
            "{} {} {} : HybridDB [{}]",
            self.level.symbol(),
            self.pid,
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.message
        )
    }

    pub fn format_detailed(&self) -> String {
        let location = match self.line {
            Some(line) => format!(" {}:{}", self.target, line),
            None => format!(" {}", self.target),
        };
        format!(
            "{} {} {} {} : HybridDB [{}]{}",
            self.level.symbol(),
            self.level,
            self.pid,
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.message,
            location
        )
    }
}

pub struct HybridTracingLayer {
    detailed: bool,
}

impl<S> tracing_subscriber::Layer<S> for HybridTracingLayer
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = LogVisitor::default();
        event.record(&mut visitor);

        let message = visitor.message.unwrap_or_else(|| metadata.name().to_string());
        let mut log = LogEvent::new(LogLevel::from(*metadata.level()), metadata.target(), message);
        log.line = metadata.line();

        if self.detailed {
            eprintln!("{}", log.format_detailed());
        } else {
            eprintln!("{}", log.format_compact());
        }
    }
}

#[derive(Default)]
struct LogVisitor {
    message: Option<String>,
}

impl tracing::field::Visit for LogVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `level` when set.
pub fn init_tracing_logger(level: LogLevel, detailed: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));

    Registry::default()
        .with(filter)
        .with(HybridTracingLayer { detailed })
        .try_init()
        .map_err(|e| HybridError::Configuration(format!("Failed to initialize logging: {}", e)))
}
