// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Time-stamped message queues drained once per audio block.
//!
//! Producers are the transport callback threads, the consumer is the audio
//! thread. The queue is a bounded crossbeam channel, so pushing never allocates
//! and never waits on the consumer. When the queue is full the oldest message is
//! evicted to make room for the newest one.

use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Instant,
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::warn;

use crate::{midi::Message, routing::TrafficClass};

/// The default number of messages a collector holds before evicting.
pub const DEFAULT_CAPACITY: usize = 1024;

/// When more time passed since the last block than this many blocks, the oldest
/// messages are squeezed together at the start of the block.
const MAX_SOURCE_SPAN_BLOCKS: usize = 32;

/// A message positioned within an audio block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MidiEvent {
    /// Sample offset from the start of the block.
    pub position: usize,
    pub message: Message,
}

/// The MIDI messages belonging to one audio block, ordered by position.
#[derive(Clone, Debug, Default)]
pub struct MidiBuffer {
    events: Vec<MidiEvent>,
}

impl MidiBuffer {
    /// Creates a buffer that can hold the given number of events without reallocating.
    pub fn with_capacity(capacity: usize) -> MidiBuffer {
        MidiBuffer {
            events: Vec::with_capacity(capacity),
        }
    }

    /// Adds an event, keeping the buffer ordered by position. Events at the same
    /// position keep the order they were added in.
    pub fn add_event(&mut self, message: Message, position: usize) {
        let index = self.events.partition_point(|event| event.position <= position);
        self.events.insert(index, MidiEvent { position, message });
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MidiEvent> {
        self.events.iter()
    }

    /// The messages in the buffer, in order.
    pub fn messages(&self) -> impl Iterator<Item = Message> + '_ {
        self.events.iter().map(|event| event.message)
    }
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    message: Message,
    arrived: Instant,
}

/// Consumer side state. Only the draining thread and reset touch it.
struct DrainState {
    sample_rate: f64,
    last_drain: Instant,
}

/// How raw sample positions relative to the previous drain map into the block.
enum Placement {
    /// Less time passed than the block covers: push everything toward the block end.
    Shift(usize),
    /// More time passed than the block covers: scale positions down to fit.
    Scale { skip: usize, span: usize },
}

impl Placement {
    fn new(elapsed_samples: usize, num_samples: usize) -> Placement {
        let span = elapsed_samples.max(1);
        if span <= num_samples {
            return Placement::Shift(num_samples - span);
        }

        let max_span = num_samples * MAX_SOURCE_SPAN_BLOCKS;
        if span > max_span {
            Placement::Scale {
                skip: span - max_span,
                span: max_span,
            }
        } else {
            Placement::Scale { skip: 0, span }
        }
    }

    fn position(&self, raw: usize, num_samples: usize) -> usize {
        let position = match *self {
            Placement::Shift(offset) => raw.saturating_add(offset),
            Placement::Scale { skip, span } => {
                (raw.saturating_sub(skip) as u128 * num_samples as u128 / span as u128) as usize
            }
        };
        position.min(num_samples - 1)
    }
}

/// Converts the time between two instants into samples. Earlier `to` instants map to zero.
fn samples_between(from: Instant, to: Instant, sample_rate: f64) -> usize {
    (to.saturating_duration_since(from).as_secs_f64() * sample_rate.max(0.0)) as usize
}

/// A bounded, time-stamped queue of messages for one traffic class.
pub struct MessageCollector {
    tx: Sender<Entry>,
    rx: Receiver<Entry>,
    state: Mutex<DrainState>,
    /// An entry that arrived after a drain started, carried to the next block. It
    /// is older than anything still in the channel and takes up one slot of capacity.
    held: Mutex<Option<Entry>>,
    holding: AtomicBool,
    evicted: AtomicU64,
    capacity: usize,
}

impl MessageCollector {
    pub fn new(capacity: usize) -> MessageCollector {
        // A zero capacity channel is a rendezvous channel, which would never accept a message.
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        MessageCollector {
            tx,
            rx,
            state: Mutex::new(DrainState {
                sample_rate: 0.0,
                last_drain: Instant::now(),
            }),
            held: Mutex::new(None),
            holding: AtomicBool::new(false),
            evicted: AtomicU64::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of messages evicted to make room since the collector was created.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// The most messages a single drain can hand out.
    pub fn max_drain(&self) -> usize {
        self.capacity + 1
    }

    /// The number of messages waiting for the next drain.
    pub fn pending(&self) -> usize {
        self.rx.len() + usize::from(self.holding.load(Ordering::Acquire))
    }

    /// Queues a message. Safe to call from any number of threads concurrently with a drain.
    pub fn add_message_to_queue(&self, message: Message) {
        let mut entry = Entry {
            message,
            arrived: Instant::now(),
        };

        loop {
            if self.pending() >= self.capacity {
                self.evict_oldest();
            }
            match self.tx.try_send(entry) {
                Ok(()) => return,
                // Another producer filled the last slot, make room on the next pass.
                Err(TrySendError::Full(rejected)) => entry = rejected,
                // The collector owns the receiver, so this can't happen while it's alive.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Discards the oldest pending entry. Another thread may have drained in the
    /// meantime, in which case nothing is evicted.
    fn evict_oldest(&self) {
        if self.take_held().is_some() || self.rx.try_recv().is_ok() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn take_held(&self) -> Option<Entry> {
        let mut held = self.held.lock();
        self.holding.store(false, Ordering::Release);
        held.take()
    }

    fn hold(&self, entry: Entry) {
        let mut held = self.held.lock();
        *held = Some(entry);
        self.holding.store(true, Ordering::Release);
    }

    /// Clears all pending messages and sets the sample rate used for positioning.
    pub fn reset(&self, sample_rate: f64) {
        let mut state = self.state.lock();
        state.sample_rate = sample_rate;
        state.last_drain = Instant::now();
        self.take_held();
        while self.rx.try_recv().is_ok() {}
    }

    /// Drains every message that arrived before this call into the buffer, positioned
    /// within a block of `num_samples` samples. Messages arriving while the drain runs
    /// are left for the next block.
    pub fn remove_next_block_of_messages(&self, dest: &mut MidiBuffer, num_samples: usize) {
        if num_samples == 0 {
            return;
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        let since = state.last_drain;
        let sample_rate = state.sample_rate;
        state.last_drain = now;

        let placement = Placement::new(samples_between(since, now, sample_rate), num_samples);
        let mut last_position = 0;
        let mut next = self.take_held();
        loop {
            let entry = match next.take() {
                Some(entry) => entry,
                None => match self.rx.try_recv() {
                    Ok(entry) => entry,
                    Err(_) => break,
                },
            };

            if entry.arrived > now {
                self.hold(entry);
                break;
            }

            // Positions never move backwards, so queue order is kept even if two producers
            // stamped their messages out of order.
            let position = placement
                .position(samples_between(since, entry.arrived, sample_rate), num_samples)
                .max(last_position);
            last_position = position;
            dest.add_event(entry.message, position);
        }
    }
}

/// One collector per traffic class.
pub struct Collectors {
    cc_input: MessageCollector,
    cc_feedback: MessageCollector,
    note_input: MessageCollector,
    thru: MessageCollector,
}

impl Collectors {
    pub fn new(capacity: usize) -> Collectors {
        Collectors {
            cc_input: MessageCollector::new(capacity),
            cc_feedback: MessageCollector::new(capacity),
            note_input: MessageCollector::new(capacity),
            thru: MessageCollector::new(capacity),
        }
    }

    pub fn get(&self, class: TrafficClass) -> &MessageCollector {
        match class {
            TrafficClass::CcInput => &self.cc_input,
            TrafficClass::CcFeedback => &self.cc_feedback,
            TrafficClass::NoteInput => &self.note_input,
            TrafficClass::Thru => &self.thru,
        }
    }

    /// Logs the eviction count of every collector that had to make room, and
    /// returns the total. Meant for the non-realtime side.
    pub fn report_evictions(&self) -> u64 {
        TrafficClass::ALL
            .iter()
            .map(|class| {
                let evicted = self.get(*class).evicted();
                if evicted > 0 {
                    warn!(
                        class = ?class,
                        evicted, "MIDI collector evicted messages because its queue was full."
                    );
                }
                evicted
            })
            .sum()
    }

    /// Resets every collector to the given sample rate.
    pub fn reset_all(&self, sample_rate: f64) {
        TrafficClass::ALL
            .iter()
            .for_each(|class| self.get(*class).reset(sample_rate));
    }
}
