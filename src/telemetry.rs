use std::io::{IsTerminal, StderrLock, Write};
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use tracing::{Event, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::{DefaultFields, Format, Full, Json, JsonFields, Writer};
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

static STDERR: OnceLock<std::io::Stderr> = OnceLock::new();

struct LockedWriter<'a> {
    stderr: StderrLock<'a>,
}

impl LockedWriter<'_> {
    fn new() -> Self {
        LockedWriter {
            stderr: STDERR.get_or_init(std::io::stderr).lock(),
        }
    }
}

impl Write for LockedWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stderr.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stderr.flush()
    }
}

enum JsonOrNot {
    Not(Format<Full, SystemTime>),
    Json(Format<Json, SystemTime>),
}

impl<S, N> FormatEvent<S, N> for JsonOrNot
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        match self {
            JsonOrNot::Not(f) => f.format_event(ctx, writer, event),
            JsonOrNot::Json(f) => f.format_event(ctx, writer, event),
        }
    }
}

/// `-D` is debug, `-V` is trace, `-DV` together is trace; neither is info.
/// Matches the CLI's combinable-short-flag convention.
pub fn level_from_flags(debug: bool, verbose: bool) -> LevelFilter {
    if verbose {
        LevelFilter::TRACE
    } else if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
}

fn get_level_filter(level: LevelFilter) -> EnvFilter {
    let mut filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .parse("")
        .expect("empty filter parses")
        .add_directive("async_nats=info".parse().expect("valid directive"))
        .add_directive("hyper=info".parse().expect("valid directive"));

    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        match rust_log.split(',').map(str::parse).collect::<Result<Vec<_>, _>>() {
            Ok(directives) => {
                for directive in directives {
                    filter = filter.add_directive(directive);
                }
            }
            Err(err) => eprintln!("ignoring invalid RUST_LOG directive: {err}"),
        }
    }
    filter
}

fn get_default_log_layer<S>() -> Result<impl Layer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let stderr = STDERR.get().context("stderr not initialized")?;
    Ok(tracing_subscriber::fmt::layer()
        .with_writer(LockedWriter::new)
        .with_ansi(stderr.is_terminal())
        .event_format(JsonOrNot::Not(Format::default()))
        .fmt_fields(DefaultFields::new()))
}

fn get_json_log_layer<S>() -> Result<impl Layer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let stderr = STDERR.get().context("stderr not initialized")?;
    Ok(tracing_subscriber::fmt::layer()
        .with_writer(LockedWriter::new)
        .with_ansi(stderr.is_terminal())
        .event_format(JsonOrNot::Json(Format::default().json()))
        .fmt_fields(JsonFields::new()))
}

/// Installs the global subscriber. `json` selects structured output for log
/// aggregators over the default human-readable format.
pub fn init(level: LevelFilter, json: bool) -> Result<()> {
    STDERR
        .set(std::io::stderr())
        .map_err(|_| anyhow!("stderr already initialized"))?;

    let registry = tracing_subscriber::Registry::default();
    let level_filter = get_level_filter(level);

    let result = if json {
        let layer = get_json_log_layer()?;
        tracing::subscriber::set_global_default(registry.with(level_filter).with(layer))
    } else {
        let layer = get_default_log_layer()?;
        tracing::subscriber::set_global_default(registry.with(level_filter).with(layer))
    };
    result.map_err(|err| anyhow!(err).context("logger was already initialized"))
}
