//! vocast command-line front end
//!
//! The binary in `main.rs` only parses arguments and installs logging; the
//! commands live here so they can be driven from integration tests.

pub mod cli;
pub mod commands;
pub mod progress;
pub mod settings;

pub use cli::{Cli, Commands, PlayArgs, SpeakArgs};
pub use settings::load_settings;
