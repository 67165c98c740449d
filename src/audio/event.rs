//! Fixed-size records carried over the byte ring buffers.
//!
//! Every record encodes to exactly [`RECORD_SIZE`] bytes, so a sender
//! either writes a whole record or nothing and a receiver never sees half
//! of one. Nothing here allocates after the channel is built.

use std::marker::PhantomData;

use super::ring_buffer::{Consumer, Producer, RingBuffer, MAX_CAPACITY};
use crate::error::{Error, Result};

/// Encoded size of every record: one tag byte plus payload.
pub const RECORD_SIZE: usize = 8;

/// A value that travels through a ring buffer as a fixed-size record.
pub trait Record: Sized + Copy {
    fn encode(&self) -> [u8; RECORD_SIZE];

    /// Returns `None` for an unknown tag.
    fn decode(bytes: &[u8; RECORD_SIZE]) -> Option<Self>;
}

/// Notification from the process thread to the control thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SequencerEvent {
    /// The playhead entered `step`, `time` frames after the transport started
    /// (wrapping at u32).
    StepAdvanced { step: u16, time: u32 },
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    TransportChanged { playing: bool },
    TempoChanged { bpm: f32 },
}

/// Request from the control thread to the process thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    Start,
    Stop,
    SetTempo { bpm: f32 },
    ToggleStep { track: u8, step: u16 },
    SetVelocity { track: u8, velocity: u8 },
    ClearPattern,
}

impl Record for SequencerEvent {
    fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut b = [0u8; RECORD_SIZE];
        match *self {
            SequencerEvent::StepAdvanced { step, time } => {
                b[0] = 1;
                b[2..4].copy_from_slice(&step.to_le_bytes());
                b[4..8].copy_from_slice(&time.to_le_bytes());
            }
            SequencerEvent::NoteOn {
                channel,
                note,
                velocity,
            } => {
                b[0] = 2;
                b[1] = channel;
                b[2] = note;
                b[3] = velocity;
            }
            SequencerEvent::NoteOff { channel, note } => {
                b[0] = 3;
                b[1] = channel;
                b[2] = note;
            }
            SequencerEvent::TransportChanged { playing } => {
                b[0] = 4;
                b[1] = playing as u8;
            }
            SequencerEvent::TempoChanged { bpm } => {
                b[0] = 5;
                b[4..8].copy_from_slice(&bpm.to_le_bytes());
            }
        }
        b
    }

    fn decode(b: &[u8; RECORD_SIZE]) -> Option<Self> {
        let event = match b[0] {
            1 => SequencerEvent::StepAdvanced {
                step: u16::from_le_bytes([b[2], b[3]]),
                time: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            },
            2 => SequencerEvent::NoteOn {
                channel: b[1],
                note: b[2],
                velocity: b[3],
            },
            3 => SequencerEvent::NoteOff {
                channel: b[1],
                note: b[2],
            },
            4 => SequencerEvent::TransportChanged { playing: b[1] != 0 },
            5 => SequencerEvent::TempoChanged {
                bpm: f32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            },
            _ => return None,
        };
        Some(event)
    }
}

impl Record for ControlCommand {
    fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut b = [0u8; RECORD_SIZE];
        match *self {
            ControlCommand::Start => b[0] = 1,
            ControlCommand::Stop => b[0] = 2,
            ControlCommand::SetTempo { bpm } => {
                b[0] = 3;
                b[4..8].copy_from_slice(&bpm.to_le_bytes());
            }
            ControlCommand::ToggleStep { track, step } => {
                b[0] = 4;
                b[1] = track;
                b[2..4].copy_from_slice(&step.to_le_bytes());
            }
            ControlCommand::SetVelocity { track, velocity } => {
                b[0] = 5;
                b[1] = track;
                b[2] = velocity;
            }
            ControlCommand::ClearPattern => b[0] = 6,
        }
        b
    }

    fn decode(b: &[u8; RECORD_SIZE]) -> Option<Self> {
        let command = match b[0] {
            1 => ControlCommand::Start,
            2 => ControlCommand::Stop,
            3 => ControlCommand::SetTempo {
                bpm: f32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            },
            4 => ControlCommand::ToggleStep {
                track: b[1],
                step: u16::from_le_bytes([b[2], b[3]]),
            },
            5 => ControlCommand::SetVelocity {
                track: b[1],
                velocity: b[2],
            },
            6 => ControlCommand::ClearPattern,
            _ => return None,
        };
        Some(command)
    }
}

/// Sending end of a record channel. Wait-free.
pub struct RecordSender<T: Record> {
    producer: Producer,
    _marker: PhantomData<T>,
}

impl<T: Record> RecordSender<T> {
    /// Enqueues a record. Returns `Err(record)` if a whole record does not fit.
    pub fn try_send(&mut self, record: T) -> std::result::Result<(), T> {
        if self.producer.writable_space() < RECORD_SIZE {
            return Err(record);
        }
        // Only this side writes, so the free space checked above cannot shrink.
        let written = self.producer.write(&record.encode());
        debug_assert_eq!(written, RECORD_SIZE);
        Ok(())
    }

    /// Records the channel holds when full.
    pub fn capacity(&self) -> usize {
        self.producer.capacity() / RECORD_SIZE
    }

    /// Records currently queued.
    pub fn len(&self) -> usize {
        self.producer.readable_space() / RECORD_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving end of a record channel. Wait-free.
pub struct RecordReceiver<T: Record> {
    consumer: Consumer,
    _marker: PhantomData<T>,
}

impl<T: Record> RecordReceiver<T> {
    /// Dequeues the next record, or `None` if no whole record is queued.
    pub fn try_recv(&mut self) -> Option<T> {
        let mut bytes = [0u8; RECORD_SIZE];
        while self.consumer.readable_space() >= RECORD_SIZE {
            self.consumer.read(&mut bytes);
            if let Some(record) = T::decode(&bytes) {
                return Some(record);
            }
        }
        None
    }

    /// Drains records until the channel is empty.
    pub fn try_iter(&mut self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(move || self.try_recv())
    }

    pub fn capacity(&self) -> usize {
        self.consumer.capacity() / RECORD_SIZE
    }

    pub fn len(&self) -> usize {
        self.consumer.readable_space() / RECORD_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Creates a channel holding up to `records` records.
pub fn record_channel<T: Record>(records: usize) -> Result<(RecordSender<T>, RecordReceiver<T>)> {
    let capacity = records
        .checked_mul(RECORD_SIZE)
        .ok_or(Error::CapacityTooLarge {
            requested: records,
            max: MAX_CAPACITY / RECORD_SIZE,
        })?;
    let (producer, consumer) = RingBuffer::new(capacity)?.split();
    Ok((
        RecordSender {
            producer,
            _marker: PhantomData,
        },
        RecordReceiver {
            consumer,
            _marker: PhantomData,
        },
    ))
}

pub type EventSender = RecordSender<SequencerEvent>;
pub type EventReceiver = RecordReceiver<SequencerEvent>;
pub type CommandSender = RecordSender<ControlCommand>;
pub type CommandReceiver = RecordReceiver<ControlCommand>;

/// Process thread -> control thread.
pub fn event_channel(records: usize) -> Result<(EventSender, EventReceiver)> {
    record_channel(records)
}

/// Control thread -> process thread.
pub fn command_channel(records: usize) -> Result<(CommandSender, CommandReceiver)> {
    record_channel(records)
}
