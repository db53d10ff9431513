//! Logging utilities for Sift
//!
//! This module initializes the tracing subscriber used by all components.

use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Custom event formatter for Sift logs
pub struct SiftFormatter;

impl<S, N> FormatEvent<S, N> for SiftFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(writer, "[{} ", now.format("%Y-%m-%d %H:%M:%S%.3f"))?;

        let level = *event.metadata().level();
        match level {
            Level::TRACE => write!(writer, "TRACE")?,
            Level::DEBUG => write!(writer, "DEBUG")?,
            Level::INFO => write!(writer, "INFO ")?,
            Level::WARN => write!(writer, "WARN ")?,
            Level::ERROR => write!(writer, "ERROR")?,
        }
        write!(writer, "] ")?;

        if let Some(module_path) = event.metadata().module_path() {
            write!(writer, "[{}] ", module_path)?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Initialize the logging system
pub fn init_logging(log_level: Level, log_file: Option<&str>) {
    let file = log_file.and_then(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eprintln!("Failed to open log file {}: {}", path, e))
            .ok()
    });

    let result = match file {
        Some(file) => tracing::subscriber::set_global_default(
            tracing_subscriber::fmt()
                .with_max_level(log_level)
                .event_format(SiftFormatter)
                .with_writer(Mutex::new(file))
                .finish(),
        ),
        None => tracing::subscriber::set_global_default(
            tracing_subscriber::fmt()
                .with_max_level(log_level)
                .event_format(SiftFormatter)
                .finish(),
        ),
    };

    result.expect("Failed to set global default subscriber");
}
