//! Tracing subscriber setup: console formatter, per-run file layer, and
//! initialisation.
use std::fs;
use std::io::Write as _;
use std::sync::Mutex;

use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;

use super::utils::{format_utc_datetime, format_utc_time, log_file_path, strip_ansi};

/// Span and event fields copied onto every line of the run log.
const CONTEXT_FIELDS: [&str; 3] = ["operation", "snapshot", "item"];

/// Values of [`CONTEXT_FIELDS`] seen on a span or event, in field order.
#[derive(Debug, Default, Clone)]
struct RunFields(Vec<(&'static str, String)>);

impl RunFields {
    fn set(&mut self, name: &'static str, value: String) {
        if let Some(slot) = self.0.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.0.push((name, value));
        }
    }

    fn merge(&mut self, other: &Self) {
        for (name, value) in &other.0 {
            self.set(*name, value.clone());
        }
    }

    /// ` [operation=backup snapshot=… item=…]`, or empty.
    fn suffix(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let mut ordered: Vec<&(&str, String)> = self.0.iter().collect();
        ordered.sort_by_key(|(name, _)| CONTEXT_FIELDS.iter().position(|f| f == name));
        let pairs: Vec<String> = ordered.iter().map(|(n, v)| format!("{n}={v}")).collect();
        format!(" [{}]", pairs.join(" "))
    }
}

impl Visit for RunFields {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if CONTEXT_FIELDS.contains(&field.name()) {
            self.set(field.name(), format!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if CONTEXT_FIELDS.contains(&field.name()) {
            self.set(field.name(), value.to_string());
        }
    }
}

/// Extracts the `message` field and any run fields from a [`tracing::Event`].
#[derive(Default)]
struct MessageExtractor {
    message: String,
    fields: RunFields,
}

impl Visit for MessageExtractor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.record_debug(field, value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.record_str(field, value);
        }
    }
}

/// A [`tracing_subscriber::Layer`] that writes every event of one run to its
/// own log file, with timestamps, ANSI codes stripped and the `operation`,
/// `snapshot` and `item` fields of the enclosing spans appended.
///
/// Created by [`init_subscriber`] so that file output goes through the same
/// tracing pipeline as console output.  Always captures events at `DEBUG`
/// level and above regardless of the console verbosity setting.
#[derive(Debug)]
pub(super) struct FileLayer {
    file: Mutex<fs::File>,
}

impl FileLayer {
    /// Create the log file for `run` (see
    /// [`run_log_name`](super::utils::run_log_name)), write a run header, and
    /// return a new `FileLayer` ready to receive events.
    ///
    /// Returns `None` if the cache directory cannot be created or the file
    /// cannot be opened.
    pub(super) fn new(run: &str) -> Option<Self> {
        let path = log_file_path(run)?;
        let version =
            option_env!("STATEKEEP_VERSION").unwrap_or(concat!("dev-", env!("CARGO_PKG_VERSION")));
        let header = format!(
            "==========================================\n\
             statekeep {version} {run} {}\n\
             ==========================================\n",
            format_utc_datetime(),
        );
        fs::write(&path, header).ok()?;
        let file = fs::OpenOptions::new().append(true).open(&path).ok()?;
        Some(Self {
            file: Mutex::new(file),
        })
    }
}

impl<S> tracing_subscriber::Layer<S> for FileLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: Context<'_, S>,
    ) {
        let mut fields = RunFields::default();
        attrs.record(&mut fields);
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(fields);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = *metadata.level();
        let target = metadata.target();

        let mut fields = RunFields::default();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                if let Some(span_fields) = span.extensions().get::<RunFields>() {
                    fields.merge(span_fields);
                }
            }
        }
        let mut extractor = MessageExtractor::default();
        event.record(&mut extractor);
        fields.merge(&extractor.fields);

        let msg = strip_ansi(&extractor.message);
        let ts = format_utc_time();
        let context = fields.suffix();

        let line = match (level, target) {
            (tracing::Level::INFO, "statekeep::stage") => format!("[{ts}] ==> {msg}{context}"),
            (tracing::Level::ERROR, _) => format!("[{ts}]     [error] {msg}{context}"),
            (tracing::Level::WARN, _) => format!("[{ts}]     [warn] {msg}{context}"),
            (tracing::Level::DEBUG, _) => format!("[{ts}]     [debug] {msg}{context}"),
            _ => format!("[{ts}]     {msg}{context}"),
        };

        if let Ok(mut f) = self.file.lock() {
            writeln!(f, "{line}").ok();
        }
    }
}

/// A [`tracing_subscriber::fmt::FormatEvent`] that emits the console
/// output style (coloured level tags, `==>` stage headers).
struct ConsoleFormatter;

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for ConsoleFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let level = *metadata.level();
        let target = metadata.target();

        let mut extractor = MessageExtractor::default();
        event.record(&mut extractor);
        let msg = &extractor.message;

        match level {
            tracing::Level::ERROR => writeln!(writer, "\x1b[31mERROR\x1b[0m {msg}"),
            tracing::Level::WARN => writeln!(writer, "\x1b[33mWARN\x1b[0m  {msg}"),
            tracing::Level::INFO if target == "statekeep::stage" => {
                writeln!(writer, "\x1b[1;34m==>\x1b[0m \x1b[1m{msg}\x1b[0m")
            }
            tracing::Level::INFO => writeln!(writer, "  {msg}"),
            _ => writeln!(writer, "  \x1b[2m{msg}\x1b[0m"),
        }
    }
}

/// Initialise the global [`tracing`] subscriber.
///
/// Sets up a console subscriber that formats events with
/// [`ConsoleFormatter`] and a file subscriber that writes all events (including
/// `debug`) to `$XDG_CACHE_HOME/statekeep/logs/<run>.log`, where `run` comes
/// from [`run_log_name`](super::utils::run_log_name).
/// Must be called once at program startup, before any logging.
pub fn init_subscriber(verbose: bool, run: &str) {
    use tracing_subscriber::fmt::writer::MakeWriterExt as _;
    use tracing_subscriber::{
        Layer as _, filter::LevelFilter, fmt, layer::SubscriberExt as _,
        util::SubscriberInitExt as _,
    };

    let console_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let make_writer = std::io::stderr
        .with_max_level(tracing::Level::WARN)
        .and(std::io::stdout.with_min_level(tracing::Level::INFO));

    let console_layer = fmt::layer()
        .event_format(ConsoleFormatter)
        .with_writer(make_writer)
        .with_filter(console_level);

    let file_layer = FileLayer::new(run).map(|l| l.with_filter(LevelFilter::DEBUG));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::logging::isolated_logger;

    fn contents(log: &crate::logging::Logger) -> String {
        fs::read_to_string(log.log_path().expect("log path")).unwrap()
    }

    #[test]
    fn run_span_fields_are_appended_to_lines() {
        let (log, _tmp, _guard) = isolated_logger();
        let run = tracing::info_span!("run", operation = "backup", snapshot = "20260314-120509");
        let _run = run.enter();
        log.warn("checksum mismatch");
        assert!(
            contents(&log)
                .contains("[warn] checksum mismatch [operation=backup snapshot=20260314-120509]")
        );
    }

    #[test]
    fn item_span_nests_inside_run_span() {
        let (log, _tmp, _guard) = isolated_logger();
        let run = tracing::info_span!("run", operation = "restore", snapshot = "one");
        let _run = run.enter();
        {
            let item = tracing::info_span!("item", item = "files/Settings");
            let _item = item.enter();
            log.debug("applying");
        }
        log.info("done");
        let text = contents(&log);
        assert!(text.contains("applying [operation=restore snapshot=one item=files/Settings]"));
        assert!(text.contains("done [operation=restore snapshot=one]"));
    }

    #[test]
    fn lines_outside_a_run_have_no_field_suffix() {
        let (log, _tmp, _guard) = isolated_logger();
        log.info("statekeep dev");
        assert!(contents(&log).contains("     statekeep dev\n"));
    }

    #[test]
    fn event_fields_override_span_fields() {
        let mut fields = RunFields::default();
        fields.set("item", "files/A".to_string());
        fields.set("operation", "sync".to_string());
        let mut event = RunFields::default();
        event.set("item", "files/B".to_string());
        fields.merge(&event);
        assert_eq!(fields.suffix(), " [operation=sync item=files/B]");
    }
}
