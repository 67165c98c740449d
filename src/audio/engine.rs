use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::event::{
    command_channel, event_channel, CommandReceiver, CommandSender, ControlCommand, EventReceiver,
    EventSender, SequencerEvent,
};
use crate::config::{EngineConfig, MAX_TEMPO_BPM, MIN_TEMPO_BPM};
use crate::error::{Error, Result};

// ─── Pattern ───

/// Tracks x steps grid of active cells, with one velocity per track.
///
/// Allocated once at setup; edits on the process thread never allocate.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    tracks: u8,
    steps: u16,
    cells: Vec<bool>,
    velocity: Vec<u8>,
}

pub const DEFAULT_VELOCITY: u8 = 100;

impl Pattern {
    pub fn new(tracks: u8, steps: u16) -> Self {
        Self {
            tracks,
            steps,
            cells: vec![false; tracks as usize * steps as usize],
            velocity: vec![DEFAULT_VELOCITY; tracks as usize],
        }
    }

    pub fn tracks(&self) -> u8 {
        self.tracks
    }

    pub fn steps(&self) -> u16 {
        self.steps
    }

    #[inline]
    fn index(&self, track: u8, step: u16) -> Option<usize> {
        if track < self.tracks && step < self.steps {
            Some(track as usize * self.steps as usize + step as usize)
        } else {
            None
        }
    }

    pub fn is_active(&self, track: u8, step: u16) -> bool {
        self.index(track, step).map_or(false, |i| self.cells[i])
    }

    /// Flips a cell. Out-of-range cells are ignored.
    pub fn toggle(&mut self, track: u8, step: u16) {
        if let Some(i) = self.index(track, step) {
            self.cells[i] = !self.cells[i];
        }
    }

    pub fn velocity(&self, track: u8) -> u8 {
        self.velocity.get(track as usize).copied().unwrap_or(0)
    }

    /// Velocity is kept in 1..=127; 0 would read as a note-off.
    pub fn set_velocity(&mut self, track: u8, velocity: u8) {
        if let Some(v) = self.velocity.get_mut(track as usize) {
            *v = velocity.clamp(1, 127);
        }
    }

    pub fn clear(&mut self) {
        self.cells.iter_mut().for_each(|c| *c = false);
    }
}

// ─── Processor (real-time side) ───

/// Counters shared between the process thread and the control side.
#[derive(Default)]
pub struct Counters {
    /// Events that did not fit in the event ring.
    pub dropped_events: AtomicU64,
    /// Process cycles run since start.
    pub periods: AtomicU64,
}

/// The part that runs inside the audio callback.
///
/// `process` never blocks, never allocates and never logs: commands come in
/// through one ring, events go out through the other, and an event that
/// does not fit is counted and dropped.
pub struct Processor {
    config: EngineConfig,
    pattern: Pattern,
    commands: CommandReceiver,
    events: EventSender,
    counters: Arc<Counters>,
    playing: bool,
    tempo_bpm: f32,
    frames_per_step: f64,
    /// Distance from the start of the next period to the next step boundary.
    frames_to_next_step: f64,
    next_step: u16,
    /// Frames since the transport started.
    time: u64,
    /// Bit n set while track n's note is on.
    sounding: u32,
}

impl Processor {
    pub fn new(
        config: EngineConfig,
        commands: CommandReceiver,
        events: EventSender,
        counters: Arc<Counters>,
    ) -> Self {
        let pattern = Pattern::new(config.tracks, config.steps);
        let tempo_bpm = config.tempo_bpm;
        let frames_per_step = config.frames_per_step(tempo_bpm);
        Self {
            config,
            pattern,
            commands,
            events,
            counters,
            playing: false,
            tempo_bpm,
            frames_per_step,
            frames_to_next_step: 0.0,
            next_step: 0,
            time: 0,
            sounding: 0,
        }
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn tempo_bpm(&self) -> f32 {
        self.tempo_bpm
    }

    /// One process cycle of `nframes` frames.
    pub fn process(&mut self, nframes: u32) {
        self.counters.periods.fetch_add(1, Ordering::Relaxed);

        while let Some(command) = self.commands.try_recv() {
            self.apply(command);
        }

        if !self.playing {
            return;
        }

        let period = nframes as f64;
        let mut pos = self.frames_to_next_step;
        while pos < period {
            let at = self.time + pos as u64;
            self.fire_step(at);
            pos += self.frames_per_step;
        }
        self.frames_to_next_step = pos - period;
        self.time += nframes as u64;
    }

    fn apply(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Start => {
                if !self.playing {
                    self.playing = true;
                    self.time = 0;
                    self.next_step = 0;
                    self.frames_to_next_step = 0.0;
                    self.emit(SequencerEvent::TransportChanged { playing: true });
                }
            }
            ControlCommand::Stop => {
                if self.playing {
                    self.release_notes();
                    self.playing = false;
                    self.emit(SequencerEvent::TransportChanged { playing: false });
                }
            }
            ControlCommand::SetTempo { bpm } => {
                if !bpm.is_finite() {
                    return;
                }
                let bpm = bpm.clamp(MIN_TEMPO_BPM, MAX_TEMPO_BPM);
                let frames_per_step = self.config.frames_per_step(bpm);
                // Keep the playhead at the same fraction of the current step.
                self.frames_to_next_step *= frames_per_step / self.frames_per_step;
                self.frames_per_step = frames_per_step;
                self.tempo_bpm = bpm;
                self.emit(SequencerEvent::TempoChanged { bpm });
            }
            ControlCommand::ToggleStep { track, step } => self.pattern.toggle(track, step),
            ControlCommand::SetVelocity { track, velocity } => {
                self.pattern.set_velocity(track, velocity)
            }
            ControlCommand::ClearPattern => self.pattern.clear(),
        }
    }

    fn fire_step(&mut self, at: u64) {
        self.release_notes();

        let step = self.next_step;
        self.emit(SequencerEvent::StepAdvanced {
            step,
            time: at as u32,
        });

        for track in 0..self.pattern.tracks() {
            if self.pattern.is_active(track, step) {
                self.emit(SequencerEvent::NoteOn {
                    channel: self.config.midi_channel,
                    note: self.config.base_note + track,
                    velocity: self.pattern.velocity(track),
                });
                self.sounding |= 1 << track;
            }
        }

        self.next_step = (step + 1) % self.pattern.steps();
    }

    fn release_notes(&mut self) {
        while self.sounding != 0 {
            let track = self.sounding.trailing_zeros() as u8;
            self.sounding &= !(1 << track);
            self.emit(SequencerEvent::NoteOff {
                channel: self.config.midi_channel,
                note: self.config.base_note + track,
            });
        }
    }

    #[inline]
    fn emit(&mut self, event: SequencerEvent) {
        if self.events.try_send(event).is_err() {
            self.counters.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ─── Transport State (control side) ───

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct TransportState {
    pub playing: bool,
    pub tempo_bpm: f32,
    /// Step under the playhead, if the transport has reached one.
    pub current_step: Option<u16>,
    /// Notes currently on, in the order they started.
    pub sounding_notes: Vec<u8>,
    pub events_received: u64,
}

impl TransportState {
    fn apply(&mut self, event: &SequencerEvent) {
        self.events_received += 1;
        match *event {
            SequencerEvent::StepAdvanced { step, .. } => self.current_step = Some(step),
            SequencerEvent::NoteOn { note, .. } => {
                if !self.sounding_notes.contains(&note) {
                    self.sounding_notes.push(note);
                }
            }
            SequencerEvent::NoteOff { note, .. } => self.sounding_notes.retain(|&n| n != note),
            SequencerEvent::TransportChanged { playing } => {
                self.playing = playing;
                if !playing {
                    self.current_step = None;
                }
            }
            SequencerEvent::TempoChanged { bpm } => self.tempo_bpm = bpm,
        }
    }
}

// ─── Engine Diagnostics ───

#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineDiagnostics {
    /// Event ring capacity in records.
    pub event_queue_capacity: usize,
    /// Event records waiting for the control thread.
    pub event_queue_filled: usize,
    pub command_queue_capacity: usize,
    /// Commands not yet picked up by the process thread.
    pub command_queue_filled: usize,
    /// Events lost because the event ring was full.
    pub dropped_events: u64,
    pub periods_processed: u64,
    /// Length of one process cycle in milliseconds.
    pub period_ms: f64,
}

// ─── Sequencer Engine ───

enum EngineCommand {
    Shutdown,
}

/// Owns the process thread and the control ends of both rings.
///
/// The control methods take `&self` so any non-real-time thread can drive
/// the engine; the mutexes here only ever guard the control-side ends,
/// never anything the process thread touches.
pub struct SequencerEngine {
    lifecycle_tx: Sender<EngineCommand>,
    commands: Mutex<CommandSender>,
    events: Mutex<EventReceiver>,
    state: Mutex<TransportState>,
    counters: Arc<Counters>,
    reported_drops: AtomicU64,
    config: EngineConfig,
    thread: Option<JoinHandle<()>>,
}

impl SequencerEngine {
    /// Validates `config`, builds both rings and spawns the process thread.
    pub fn start(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let (command_tx, command_rx) = command_channel(config.command_queue_len)?;
        let (event_tx, event_rx) = event_channel(config.event_queue_len)?;
        let (lifecycle_tx, lifecycle_rx) = bounded::<EngineCommand>(4);
        let counters = Arc::new(Counters::default());

        let processor = Processor::new(config.clone(), command_rx, event_tx, counters.clone());
        let period_frames = config.period_frames;
        let period = config.period();

        let thread = thread::Builder::new()
            .name("sequencer-process".into())
            .spawn(move || process_thread(lifecycle_rx, processor, period_frames, period))
            .map_err(|e| Error::Thread(e.to_string()))?;

        log::info!(
            "Sequencer started: {} Hz, {} frames/period, {} tracks x {} steps",
            config.sample_rate,
            config.period_frames,
            config.tracks,
            config.steps
        );

        Ok(Self {
            lifecycle_tx,
            commands: Mutex::new(command_tx),
            events: Mutex::new(event_rx),
            state: Mutex::new(TransportState {
                tempo_bpm: config.tempo_bpm,
                ..Default::default()
            }),
            counters,
            reported_drops: AtomicU64::new(0),
            config,
            thread: Some(thread),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn send(&self, command: ControlCommand) -> Result<()> {
        self.commands
            .lock()
            .try_send(command)
            .map_err(|_| Error::QueueFull)
    }

    pub fn play(&self) -> Result<()> {
        self.send(ControlCommand::Start)
    }

    pub fn stop(&self) -> Result<()> {
        self.send(ControlCommand::Stop)
    }

    /// The process thread clamps the tempo to the supported range.
    pub fn set_tempo(&self, bpm: f32) -> Result<()> {
        self.send(ControlCommand::SetTempo { bpm })
    }

    pub fn toggle_step(&self, track: u8, step: u16) -> Result<()> {
        self.check_track(track)?;
        if step >= self.config.steps {
            return Err(Error::OutOfRange {
                what: "step",
                value: step as usize,
                len: self.config.steps as usize,
            });
        }
        self.send(ControlCommand::ToggleStep { track, step })
    }

    pub fn set_velocity(&self, track: u8, velocity: u8) -> Result<()> {
        self.check_track(track)?;
        self.send(ControlCommand::SetVelocity { track, velocity })
    }

    pub fn clear_pattern(&self) -> Result<()> {
        self.send(ControlCommand::ClearPattern)
    }

    fn check_track(&self, track: u8) -> Result<()> {
        if track >= self.config.tracks {
            return Err(Error::OutOfRange {
                what: "track",
                value: track as usize,
                len: self.config.tracks as usize,
            });
        }
        Ok(())
    }

    /// Drains every queued event and folds it into the transport state.
    pub fn poll_events(&self) -> Vec<SequencerEvent> {
        let drained: Vec<SequencerEvent> = self.events.lock().try_iter().collect();

        {
            let mut state = self.state.lock();
            for event in &drained {
                state.apply(event);
            }
        }

        let dropped = self.counters.dropped_events.load(Ordering::Relaxed);
        let reported = self.reported_drops.swap(dropped, Ordering::Relaxed);
        if dropped > reported {
            log::warn!(
                "Event queue overflowed: {} events dropped since last poll",
                dropped - reported
            );
        }

        drained
    }

    /// Snapshot as of the last `poll_events`.
    pub fn state(&self) -> TransportState {
        self.state.lock().clone()
    }

    pub fn diagnostics(&self) -> EngineDiagnostics {
        let (event_queue_capacity, event_queue_filled) = {
            let events = self.events.lock();
            (events.capacity(), events.len())
        };
        let (command_queue_capacity, command_queue_filled) = {
            let commands = self.commands.lock();
            (commands.capacity(), commands.len())
        };

        EngineDiagnostics {
            event_queue_capacity,
            event_queue_filled,
            command_queue_capacity,
            command_queue_filled,
            dropped_events: self.counters.dropped_events.load(Ordering::Relaxed),
            periods_processed: self.counters.periods.load(Ordering::Relaxed),
            period_ms: self.config.period().as_secs_f64() * 1000.0,
        }
    }

    /// Stops the process thread and waits for it.
    pub fn shutdown(mut self) -> Result<()> {
        self.join()
    }

    fn join(&mut self) -> Result<()> {
        let Some(handle) = self.thread.take() else {
            return Ok(());
        };
        let _ = self.lifecycle_tx.send(EngineCommand::Shutdown);
        handle
            .join()
            .map_err(|_| Error::Thread("process thread panicked".into()))?;
        log::info!("Sequencer stopped");
        Ok(())
    }
}

impl Drop for SequencerEngine {
    fn drop(&mut self) {
        if let Err(e) = self.join() {
            log::error!("Shutdown failed: {}", e);
        }
    }
}

// ─── Process Thread ───

/// Runs one process cycle per period until told to stop. Cycles are
/// scheduled against absolute deadlines so they don't drift.
fn process_thread(
    lifecycle_rx: Receiver<EngineCommand>,
    mut processor: Processor,
    period_frames: u32,
    period: std::time::Duration,
) {
    let mut deadline = Instant::now() + period;
    loop {
        match lifecycle_rx.recv_deadline(deadline) {
            Ok(EngineCommand::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {
                processor.process(period_frames);
                deadline += period;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
