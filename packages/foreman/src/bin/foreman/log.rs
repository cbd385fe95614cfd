use clap::ValueEnum;
use color_eyre::Result;
use tracing_error::ErrorLayer;
use tracing_subscriber::{Layer as _, fmt::MakeWriter, layer::SubscriberExt as _};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum WhenColor {
    Always,
    Never,
    Auto,
}

pub fn make_logger<W>(writer: W, color: WhenColor, verbose: bool) -> Result<impl tracing::Subscriber>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let default_filter = if verbose { "foreman=debug" } else { "foreman=warn" };
    let logger = tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with({
            let layer = tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(true)
                .with_writer(writer);
            match color {
                WhenColor::Always => layer.with_ansi(true),
                WhenColor::Never => layer.with_ansi(false),
                WhenColor::Auto => layer,
            }
            .with_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_env_var("FOREMAN_LOG")
                    .try_from_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
            )
        });
    Ok(logger)
}
