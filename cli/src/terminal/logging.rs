use std::fmt;

use colored::*;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::fmt::format::{self, Writer};
use tracing_subscriber::registry::LookupSpan;

use crate::terminal::spinner::TerminalWriter;

/// Target of events that carry pre-rendered terminal output.
pub const PRINT_TARGET: &str = "sweepr::print";

pub struct SweeprFormatter;

impl<S, N> FormatEvent<S, N> for SweeprFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> format::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();

        if meta.target() == PRINT_TARGET {
            let mut raw = RawMessage::default();
            event.record(&mut raw);
            return writeln!(writer, "{}", raw.0);
        }

        let (symbol, color_func): (&str, fn(ColoredString) -> ColoredString) = match *meta.level() {
            Level::TRACE => ("[ ]", |s| s.dimmed()),
            Level::DEBUG => ("[?]", |s| s.blue()),
            Level::INFO => ("[+]", |s| s.green().bold()),
            Level::WARN => ("[*]", |s| s.yellow().bold()),
            Level::ERROR => ("[-]", |s| s.red().bold()),
        };

        write!(writer, "{} ", color_func(symbol.into()))?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

#[derive(Default)]
struct RawMessage(String);

impl Visit for RawMessage {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "raw_msg" {
            self.0 = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "raw_msg" {
            self.0 = format!("{value:?}");
        }
    }
}

/// `-v` enables debug output, `-vv` and more enable trace (packet dumps).
/// `RUST_LOG` overrides both.
pub fn init_logging(verbosity: u8) {
    let level: &str = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter: EnvFilter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(SweeprFormatter)
        .with_writer(|| TerminalWriter)
        .init();
}
