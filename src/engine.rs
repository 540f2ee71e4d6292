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

//! The per-block processing step, and a clock that drives it when there is no
//! audio engine to do so.

use std::{
    error::Error,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, error, info, span, Level};

use crate::{
    collector::MidiBuffer,
    manager::DeviceManager,
    routing::{TrafficClass, TransportMode},
};

mod thread_priority;

/// One drained buffer per traffic class, reused from block to block.
pub struct BlockBuffers {
    cc_input: MidiBuffer,
    cc_feedback: MidiBuffer,
    note_input: MidiBuffer,
    thru: MidiBuffer,
}

impl BlockBuffers {
    /// Creates buffers that hold the given number of messages each without reallocating.
    pub fn new(capacity: usize) -> BlockBuffers {
        BlockBuffers {
            cc_input: MidiBuffer::with_capacity(capacity),
            cc_feedback: MidiBuffer::with_capacity(capacity),
            note_input: MidiBuffer::with_capacity(capacity),
            thru: MidiBuffer::with_capacity(capacity),
        }
    }

    pub fn get(&self, class: TrafficClass) -> &MidiBuffer {
        match class {
            TrafficClass::CcInput => &self.cc_input,
            TrafficClass::CcFeedback => &self.cc_feedback,
            TrafficClass::NoteInput => &self.note_input,
            TrafficClass::Thru => &self.thru,
        }
    }

    fn get_mut(&mut self, class: TrafficClass) -> &mut MidiBuffer {
        match class {
            TrafficClass::CcInput => &mut self.cc_input,
            TrafficClass::CcFeedback => &mut self.cc_feedback,
            TrafficClass::NoteInput => &mut self.note_input,
            TrafficClass::Thru => &mut self.thru,
        }
    }
}

/// Runs one block: drains every collector into the buffers, then hands the
/// pass-through and feedback buffers to their outputs.
pub fn process_block(manager: &DeviceManager, buffers: &mut BlockBuffers, num_samples: usize) {
    for class in TrafficClass::ALL {
        let buffer = buffers.get_mut(class);
        buffer.clear();
        manager
            .collector(class)
            .remove_next_block_of_messages(buffer, num_samples);
    }

    manager.send_thru_messages(&buffers.thru, 0);
    manager.send_feedback_messages(&buffers.cc_feedback, 0);
}

/// A thread that runs `process_block` at the manager's sample rate.
pub struct BlockClock {
    running: Arc<AtomicBool>,
    blocks: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl BlockClock {
    /// Starts the clock with the given number of frames per block.
    pub fn start(manager: Arc<DeviceManager>, block_size: usize) -> Result<BlockClock, Box<dyn Error>> {
        if manager.mode() == TransportMode::Plugin {
            return Err("the block clock only runs standalone, the plugin host drives blocks".into());
        }

        let block_size = block_size.max(1);
        let running = Arc::new(AtomicBool::new(true));
        let blocks = Arc::new(AtomicU64::new(0));
        let priority = thread_priority::block_thread_priority();
        let rt = thread_priority::rt_enabled();

        let handle = {
            let running = running.clone();
            let blocks = blocks.clone();
            thread::Builder::new()
                .name("block clock".to_string())
                .spawn(move || {
                    thread_priority::configure_block_thread_priority(priority, rt);
                    run(manager, block_size, running, blocks)
                })?
        };

        info!(block_size, "Block clock started.");
        Ok(BlockClock {
            running,
            blocks,
            handle: Some(handle),
        })
    }

    /// The number of blocks processed so far.
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    /// Stops the clock and waits for the last block to finish. Safe to call more than once.
    pub fn stop(&mut self) {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return,
        };

        self.running.store(false, Ordering::Relaxed);
        if handle.join().is_err() {
            error!("Block clock thread panicked.");
        }
        info!(blocks = self.blocks(), "Block clock stopped.");
    }
}

impl Drop for BlockClock {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The wall time one block covers. Zero when the rate can't give a usable period.
fn block_duration(block_size: usize, sample_rate: f64) -> Duration {
    if sample_rate > 0.0 {
        Duration::try_from_secs_f64(block_size as f64 / sample_rate).unwrap_or(Duration::ZERO)
    } else {
        Duration::ZERO
    }
}

fn run(manager: Arc<DeviceManager>, block_size: usize, running: Arc<AtomicBool>, blocks: Arc<AtomicU64>) {
    let span = span!(Level::INFO, "block clock");
    let _enter = span.enter();

    let max_drain = TrafficClass::ALL
        .iter()
        .map(|class| manager.collector(*class).max_drain())
        .max()
        .unwrap_or_default();
    let mut buffers = BlockBuffers::new(max_drain);
    let mut next_block = Instant::now();
    while running.load(Ordering::Relaxed) {
        let period = block_duration(block_size, manager.sample_rate());
        if period.is_zero() {
            // No sample rate yet, idle until there is one.
            spin_sleep::sleep(Duration::from_millis(10));
            next_block = Instant::now();
            continue;
        }

        process_block(&manager, &mut buffers, block_size);
        blocks.fetch_add(1, Ordering::Relaxed);

        next_block += period;
        let now = Instant::now();
        if next_block > now {
            spin_sleep::sleep(next_block - now);
        } else if now - next_block > period {
            debug!(behind = ?(now - next_block), "Block clock fell behind, skipping ahead.");
            next_block = now;
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crate::{
        config::Settings,
        manager::DeviceManager,
        midi::{
            message::{control_change, note_on},
            mock,
        },
        routing::{InputRole, OutputRole, TrafficClass, TransportMode},
        testutil::eventually,
    };

    use super::{block_duration, process_block, BlockBuffers, BlockClock};

    fn manager(transport: &mock::Transport) -> Arc<DeviceManager> {
        let manager = Arc::new(DeviceManager::new(
            Arc::new(transport.clone()),
            &Settings::default(),
        ));
        manager.routing().set_thru(true);
        manager.open_in_port(InputRole::Notes, "mock-input-1");
        assert!(manager.open_out_port(OutputRole::Thru, "mock-output-1"));
        assert!(manager.open_out_port(OutputRole::Feedback, "mock-output-2"));
        manager
    }

    #[test]
    fn process_block_drains_and_forwards() {
        let transport = mock::Transport::get("mock");
        let manager = manager(&transport);

        transport.inject("mock-input-1", note_on(1, 60, 100).bytes());
        manager
            .collector(TrafficClass::CcFeedback)
            .add_message_to_queue(control_change(1, 20, 127));

        let mut buffers = BlockBuffers::new(16);
        process_block(&manager, &mut buffers, 512);

        assert_eq!(1, buffers.get(TrafficClass::NoteInput).len());
        assert_eq!(1, buffers.get(TrafficClass::Thru).len());
        assert_eq!(1, buffers.get(TrafficClass::CcFeedback).len());
        assert!(buffers.get(TrafficClass::CcInput).is_empty());

        eventually(
            || transport.sent("mock-output-1") == vec![note_on(1, 60, 100).bytes().to_vec()],
            "Thru message was never sent",
        );
        eventually(
            || transport.sent("mock-output-2") == vec![control_change(1, 20, 127).bytes().to_vec()],
            "Feedback message was never sent",
        );

        // The next block starts from empty buffers.
        process_block(&manager, &mut buffers, 512);
        assert!(buffers.get(TrafficClass::NoteInput).is_empty());
    }

    #[test]
    fn clock_runs_blocks() {
        let transport = mock::Transport::get("mock");
        let manager = manager(&transport);

        let mut clock = BlockClock::start(manager.clone(), 64).expect("clock should start");
        eventually(|| clock.blocks() > 2, "Block clock never ran");

        transport.inject("mock-input-1", note_on(1, 62, 100).bytes());
        eventually(
            || transport.sent("mock-output-1").len() == 1,
            "Thru message was never sent by the clock",
        );

        clock.stop();
        let blocks = clock.blocks();
        clock.stop();
        assert_eq!(blocks, clock.blocks());
    }

    #[test]
    fn clock_refuses_plugin_mode() {
        let manager = Arc::new(DeviceManager::new(
            Arc::new(mock::Transport::get("mock")),
            &Settings::default().with_mode(TransportMode::Plugin),
        ));
        assert!(BlockClock::start(manager, 64).is_err());
    }

    #[test]
    fn block_durations() {
        assert!((block_duration(441, 44100.0).as_secs_f64() - 0.01).abs() < 1e-6);
        assert!(block_duration(512, 0.0).is_zero());
        assert!(block_duration(512, f64::MIN_POSITIVE / 4.0).is_zero());
        assert!(block_duration(512, f64::NAN).is_zero());
    }
}
