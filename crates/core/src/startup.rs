use std::path::PathBuf;

use tracing_appender::rolling;
use tracing_core::LevelFilter;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

pub struct TracingOptions {
    pub config: LogConfig,
    /// Directory to write rolling log files into, in addition to
    /// stdout.
    pub disk_logging: Option<PathBuf>,
    /// Name used as the log file prefix.
    pub edition: String,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            config: LogConfig::default(),
            disk_logging: None,
            edition: "asset-server".to_owned(),
        }
    }
}

/// Install the global tracing subscriber. `log`-facade macros from the
/// rest of the crate are captured through the same pipeline.
///
/// Call once per process.
pub fn configure_tracing(opts: TracingOptions) {
    let timer = tracing_subscriber::fmt::time();
    let format = tracing_subscriber::fmt::format::Format::default()
        .with_timer(timer)
        .with_line_number(true)
        .with_file(true)
        .with_target(false)
        .compact();

    let write_to = if let Some(logs_dir) = opts.disk_logging {
        let roller = rolling::Builder::new()
            .filename_prefix(&opts.edition)
            .filename_suffix("log")
            .build(logs_dir)
            .unwrap();
        BoxMakeWriter::new(std::io::stdout.and(roller))
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };

    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_writer(write_to)
        .event_format(format);

    let env_filter_layer = conf_to_filter(opts.config);

    tracing_subscriber::Registry::default()
        .with(fmt_layer)
        .with(env_filter_layer)
        .init();
}

fn conf_to_filter(conf: LogConfig) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(conf.level.unwrap_or(LevelFilter::ERROR).into())
        .parse_lossy(conf.directives.join(","))
}
