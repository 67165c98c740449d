//! Ring buffer behaviour under randomized interleavings and real threads.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::thread;

use stepseq_lib::audio::event::{event_channel, SequencerEvent};
use stepseq_lib::RingBuffer;

/// Replays random write/read/peek/skip sequences against a VecDeque model.
fn check_against_model(capacity: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut rb = RingBuffer::new(capacity).unwrap();
    let mut model: VecDeque<u8> = VecDeque::new();

    for _ in 0..2000 {
        match rng.gen_range(0..4) {
            0 => {
                let len = rng.gen_range(0..=capacity + 3);
                let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                let n = rb.write(&data);
                assert_eq!(n, data.len().min(capacity - model.len()));
                model.extend(&data[..n]);
            }
            1 => {
                let mut out = vec![0u8; rng.gen_range(0..=capacity + 3)];
                let n = rb.read(&mut out);
                assert_eq!(n, out.len().min(model.len()));
                let expected: Vec<u8> = model.drain(..n).collect();
                assert_eq!(&out[..n], &expected[..]);
            }
            2 => {
                let mut out = vec![0u8; rng.gen_range(0..=capacity)];
                let n = rb.peek(&mut out);
                let expected: Vec<u8> = model.iter().take(n).copied().collect();
                assert_eq!(&out[..n], &expected[..]);
            }
            _ => {
                let n = rb.skip(rng.gen_range(0..=capacity));
                model.drain(..n);
            }
        }

        assert_eq!(rb.readable_space(), model.len());
        assert_eq!(rb.readable_space() + rb.writable_space(), capacity);

        let (a, b) = rb.readable_slices();
        let joined: Vec<u8> = a.iter().chain(b).copied().collect();
        assert!(joined.iter().eq(model.iter()));
    }
}

#[test]
fn test_matches_model_for_various_capacities() {
    for (i, capacity) in [1usize, 2, 3, 8, 13, 64, 100].into_iter().enumerate() {
        check_against_model(capacity, 0x5eed + i as u64);
    }
}

#[test]
fn test_round_trip_below_capacity() {
    let mut rng = StdRng::seed_from_u64(7);
    for capacity in [4usize, 5, 16, 31, 256] {
        let mut rb = RingBuffer::new(capacity).unwrap();
        for _ in 0..50 {
            let data: Vec<u8> = (0..rng.gen_range(1..capacity)).map(|_| rng.gen()).collect();
            assert_eq!(rb.write(&data), data.len());
            let mut out = vec![0u8; data.len()];
            assert_eq!(rb.read(&mut out), data.len());
            assert_eq!(out, data);
        }
    }
}

#[test]
fn test_two_threads_stream_in_order() {
    const TOTAL: usize = 1 << 20;
    let mut rng = StdRng::seed_from_u64(42);
    let source: Vec<u8> = (0..TOTAL).map(|_| rng.gen()).collect();
    let expected = source.clone();

    // Odd capacity so positions keep landing at different storage offsets.
    let (mut producer, mut consumer) = RingBuffer::new(1021).unwrap().split();

    let writer = thread::spawn(move || {
        let mut rng = StdRng::seed_from_u64(1);
        let mut sent = 0;
        while sent < source.len() {
            let end = (sent + rng.gen_range(1..700)).min(source.len());
            let n = producer.write(&source[sent..end]);
            sent += n;
            if n == 0 {
                thread::yield_now();
            }
        }
    });

    let mut rng = StdRng::seed_from_u64(2);
    let mut received = Vec::with_capacity(TOTAL);
    let mut buf = vec![0u8; 900];
    while received.len() < TOTAL {
        let want = rng.gen_range(1..buf.len());
        let n = consumer.read(&mut buf[..want]);
        received.extend_from_slice(&buf[..n]);
        if n == 0 {
            thread::yield_now();
        }
    }

    writer.join().unwrap();
    assert!(received == expected);
    assert_eq!(consumer.readable_space(), 0);
}

#[test]
fn test_zero_copy_ends_across_threads() {
    const TOTAL: usize = 200_000;
    let (mut producer, mut consumer) = RingBuffer::new(333).unwrap().split();

    let writer = thread::spawn(move || {
        let mut next = 0usize;
        while next < TOTAL {
            let filled = {
                let (a, b) = producer.writable_slices();
                let mut filled = 0;
                for slot in a.iter_mut().chain(b.iter_mut()) {
                    if next + filled == TOTAL {
                        break;
                    }
                    *slot = ((next + filled) % 256) as u8;
                    filled += 1;
                }
                filled
            };
            next += producer.commit(filled);
            if filled == 0 {
                thread::yield_now();
            }
        }
    });

    let mut seen = 0usize;
    while seen < TOTAL {
        let n = {
            let (a, b) = consumer.readable_slices();
            for &byte in a.iter().chain(b) {
                assert_eq!(byte, ((seen) % 256) as u8);
                seen += 1;
            }
            a.len() + b.len()
        };
        consumer.skip(n);
        if n == 0 {
            thread::yield_now();
        }
    }

    writer.join().unwrap();
}

#[test]
fn test_records_cross_threads_whole() {
    const COUNT: u16 = 20_000;
    let (mut tx, mut rx) = event_channel(16).unwrap();

    let writer = thread::spawn(move || {
        for i in 0..COUNT {
            let mut event = SequencerEvent::StepAdvanced {
                step: i,
                time: i as u32 * 3,
            };
            loop {
                match tx.try_send(event) {
                    Ok(()) => break,
                    Err(back) => {
                        event = back;
                        thread::yield_now();
                    }
                }
            }
        }
    });

    let mut expected = 0u16;
    while expected < COUNT {
        match rx.try_recv() {
            Some(event) => {
                assert_eq!(
                    event,
                    SequencerEvent::StepAdvanced {
                        step: expected,
                        time: expected as u32 * 3,
                    }
                );
                expected += 1;
            }
            None => thread::yield_now(),
        }
    }

    writer.join().unwrap();
    assert_eq!(rx.try_recv(), None);
}
