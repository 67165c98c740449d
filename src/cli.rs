//! Command-line driver: runs the engine against a demo pattern and logs
//! what crosses the rings.

use clap::Parser;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::engine::SequencerEngine;
use crate::audio::event::SequencerEvent;
use crate::config::EngineConfig;
use crate::error::{Error, Result};

/// How often the control side drains events, roughly a GUI frame.
const POLL_INTERVAL: Duration = Duration::from_millis(16);

/// Longest transport run the demo accepts, one day.
const MAX_RUN_SECONDS: f64 = 86_400.0;

#[derive(Debug, Parser)]
#[command(name = "stepseq", about = "Step sequencer real-time core demo")]
pub struct Args {
    /// JSON engine config; defaults are used if missing.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// How long to run the transport.
    #[arg(long, default_value_t = 4.0)]
    pub seconds: f64,

    /// Override the configured tempo.
    #[arg(long)]
    pub tempo: Option<f32>,

    /// Print the effective config as JSON and exit.
    #[arg(long)]
    pub print_config: bool,
}

pub fn run(args: Args) -> Result<()> {
    let mut config = args
        .config
        .as_deref()
        .map(EngineConfig::load)
        .unwrap_or_default();
    if let Some(bpm) = args.tempo {
        config.tempo_bpm = bpm;
    }

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let run_for = run_duration(args.seconds)?;
    let engine = SequencerEngine::start(config)?;
    program_demo_pattern(&engine)?;
    engine.play()?;

    let deadline = Instant::now() + run_for;
    while Instant::now() < deadline {
        thread::sleep(POLL_INTERVAL);
        log_events(&engine.poll_events());
    }

    engine.stop()?;
    thread::sleep(engine.config().period() * 4);
    log_events(&engine.poll_events());

    println!("{}", serde_json::to_string_pretty(&engine.diagnostics())?);
    engine.shutdown()
}

fn run_duration(seconds: f64) -> Result<Duration> {
    if !(0.0..=MAX_RUN_SECONDS).contains(&seconds) {
        return Err(Error::InvalidConfig(format!(
            "--seconds must be within 0..={}, got {}",
            MAX_RUN_SECONDS, seconds
        )));
    }
    Ok(Duration::from_secs_f64(seconds))
}

/// Kick on the beat, snare on the backbeat, hats on the eighths, for
/// whichever of those tracks and steps the pattern has.
fn program_demo_pattern(engine: &SequencerEngine) -> Result<()> {
    let config = engine.config();
    let parts: [(u8, u16, u16, u8); 3] = [(0, 0, 4, 120), (1, 4, 8, 110), (2, 0, 2, 70)];

    for (track, first, every, velocity) in parts {
        if track >= config.tracks {
            continue;
        }
        engine.set_velocity(track, velocity)?;
        for step in (first..config.steps).step_by(every as usize) {
            engine.toggle_step(track, step)?;
        }
    }
    Ok(())
}

fn log_events(events: &[SequencerEvent]) {
    for event in events {
        match event {
            SequencerEvent::StepAdvanced { step, time } => {
                log::debug!("step {} at frame {}", step, time)
            }
            SequencerEvent::NoteOn {
                channel,
                note,
                velocity,
            } => log::debug!("note on  ch{} {} vel {}", channel, note, velocity),
            SequencerEvent::NoteOff { channel, note } => {
                log::trace!("note off ch{} {}", channel, note)
            }
            SequencerEvent::TransportChanged { playing } => {
                log::info!("transport {}", if *playing { "playing" } else { "stopped" })
            }
            SequencerEvent::TempoChanged { bpm } => log::info!("tempo {} BPM", bpm),
        }
    }
}
