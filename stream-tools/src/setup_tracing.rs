use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::EnvFilter, fmt};

const ENV_DEBUG: &str = "STREAM_TOOLS_DEBUG";
const ENV_LOG_FORMAT: &str = "STREAM_TOOLS_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    /// One flattened JSON object per event, the payload lines of the sinks included.
    Json,
    Text,
}

/// How the process logs, resolved from its environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LogSettings {
    format: LogFormat,
    default_level: Level,
}

impl LogSettings {
    /// `STREAM_TOOLS_DEBUG=true` lowers the default level to `debug` and logs text unless
    /// `STREAM_TOOLS_LOG_FORMAT` asks for `json` or `text` explicitly.
    fn from_vars<'a>(vars: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let (mut debug, mut format) = (false, None);
        for (key, value) in vars {
            match key {
                ENV_DEBUG => debug = value.eq_ignore_ascii_case("true"),
                ENV_LOG_FORMAT if value.eq_ignore_ascii_case("json") => {
                    format = Some(LogFormat::Json)
                }
                ENV_LOG_FORMAT if value.eq_ignore_ascii_case("text") => {
                    format = Some(LogFormat::Text)
                }
                _ => {}
            }
        }
        Self {
            format: format.unwrap_or(if debug { LogFormat::Text } else { LogFormat::Json }),
            default_level: if debug { Level::DEBUG } else { Level::INFO },
        }
    }

    fn from_env() -> Self {
        let vars: Vec<(String, String)> = [ENV_DEBUG, ENV_LOG_FORMAT]
            .into_iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
            .collect();
        Self::from_vars(vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

/// The message a panic was raised with, when it is a string.
fn panic_message<'a>(panic_info: &'a PanicHookInfo<'_>) -> Option<&'a str> {
    let payload = panic_info.payload();
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
}

/// Routes panics through `tracing` so they end up on one line of the configured format.
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    // noop unless RUST_BACKTRACE or RUST_LIB_BACKTRACE is set
    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        tracing::error!("{}\n{}", panic_info, backtrace);
        return;
    }
    match (panic_info.location(), panic_message(panic_info)) {
        (Some(location), Some(message)) => tracing::error!(
            file = location.file(),
            line = location.line(),
            column = location.column(),
            "Panicked: {message}"
        ),
        _ => tracing::error!("{}", panic_info),
    }
}

/// Installs the subscriber. `RUST_LOG` overrides the default level.
pub fn register() {
    let settings = LogSettings::from_env();

    let filter = EnvFilter::builder()
        .with_default_directive(settings.default_level.into())
        .from_env_lossy();

    let layer = match settings.format {
        LogFormat::Text => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();

    std::panic::set_hook(Box::new(report_panic));
}
