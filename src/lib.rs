pub mod audio;
pub mod cli;
pub mod config;
pub mod error;

pub use audio::ring_buffer::{Consumer, Producer, RingBuffer};
pub use error::{Error, Result};

/// Parses the command line and runs the demo engine.
pub fn run() -> Result<()> {
    use clap::Parser;
    cli::run(cli::Args::parse())
}
