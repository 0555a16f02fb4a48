use clap::ValueEnum;
use color_eyre::Result;
use tracing::Subscriber;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, registry::Registry};

/// When to colorize log output; mirrors `--color` on most CLIs that shell
/// out to `clap::ValueEnum` for this choice.
#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum WhenColor {
    Always,
    Never,
    Auto,
}

impl WhenColor {
    fn with_ansi(self) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Auto => console::colors_enabled(),
        }
    }
}

/// Build the process-wide tracing subscriber: pretty-printed spans/events
/// filtered by the `POLYBUILD_LOG` environment variable, plus
/// `tracing_error::ErrorLayer` so `color_eyre` reports can attach span
/// traces.
pub fn make_logger<W>(
    writer: W,
    color: WhenColor,
) -> Result<impl Subscriber + Send + Sync>
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let fmt_layer = fmt::layer()
        .pretty()
        .with_ansi(color.with_ansi())
        .with_writer(writer)
        .with_filter(EnvFilter::builder().with_env_var("POLYBUILD_LOG").from_env_lossy());

    Ok(Registry::default().with(fmt_layer).with(ErrorLayer::default()))
}
