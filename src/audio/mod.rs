pub mod engine;
pub mod event;
pub mod ring_buffer;
