//! vocast - play streamed speech generations

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vocast_cli::{commands, load_settings, Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = if cli.verbose {
        "vocast_cli=debug,vocast_core=debug"
    } else {
        "vocast_cli=info,vocast_core=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let settings = load_settings(cli.config.as_deref())?;
    debug!("Backend: {}", settings.stream.base_url);

    match cli.command {
        Commands::Speak(args) => {
            let outcome = commands::speak(&settings, args).await?;
            if let Some(path) = outcome.written {
                info!("Saved {} chunks to {}", outcome.chunks, path.display());
            }
        }
        Commands::Play(args) => commands::play(&settings, args).await?,
        Commands::Config => commands::print_config(&settings)?,
    }

    Ok(())
}
