//! Command-line definition

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use vocast_core::{Feature, SchedulingStrategy};

/// Play speech generations while they stream
#[derive(Parser, Debug)]
#[command(name = "vocast")]
#[command(about = "Play streamed speech generations", version)]
pub struct Cli {
    /// Settings file (TOML); defaults to the user config directory
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a generation and play it as it arrives
    Speak(SpeakArgs),
    /// Play a WAV file written by `speak`
    Play(PlayArgs),
    /// Print the effective settings as TOML
    Config,
}

#[derive(Args, Debug, Clone)]
pub struct SpeakArgs {
    /// chat, audiobook or podcast
    pub feature: Feature,

    /// Text to speak
    #[arg(long, required_unless_present = "body", conflicts_with = "body")]
    pub text: Option<String>,

    /// Raw JSON request body
    #[arg(long)]
    pub body: Option<String>,

    /// Write the combined track to this file
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Write the combined track into the configured output directory
    #[arg(long, conflicts_with = "out")]
    pub save: bool,

    /// sequential or timeline
    #[arg(long, value_parser = parse_strategy)]
    pub strategy: Option<SchedulingStrategy>,

    /// Wait for the whole generation before playing
    #[arg(long)]
    pub no_autoplay: bool,

    /// Do not open an audio device; clips are timed but silent
    #[arg(long)]
    pub headless: bool,
}

#[derive(Args, Debug, Clone)]
pub struct PlayArgs {
    pub file: PathBuf,

    /// Start offset in seconds
    #[arg(long, default_value_t = 0.0)]
    pub from: f64,

    #[arg(long)]
    pub headless: bool,
}

fn parse_strategy(value: &str) -> Result<SchedulingStrategy, String> {
    match value.to_ascii_lowercase().as_str() {
        "sequential" => Ok(SchedulingStrategy::Sequential),
        "timeline" => Ok(SchedulingStrategy::Timeline),
        other => Err(format!("unknown strategy '{other}'")),
    }
}
