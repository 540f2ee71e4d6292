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
use std::{
    error::Error,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use arc_swap::ArcSwapOption;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, span, warn, Level};

use crate::{
    collector::MidiBuffer,
    midi::{Message, OutputConnection, Transport},
    routing::OutputRole,
};

/// How many messages can wait for delivery before new ones are dropped.
const DELIVERY_QUEUE_CAPACITY: usize = 4096;

enum Outgoing {
    Message { message: Message, deadline: Instant },
    Shutdown,
}

/// An open output device with its own delivery thread. The audio thread only
/// queues messages; the delivery thread waits for each message's deadline and
/// writes it to the device.
pub struct OutputPort {
    device_name: String,
    tx: Sender<Outgoing>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
}

impl OutputPort {
    /// Opens the named device and starts its delivery thread.
    pub fn open(transport: &dyn Transport, device_name: &str) -> Result<OutputPort, Box<dyn Error>> {
        OutputPort::open_with_capacity(transport, device_name, DELIVERY_QUEUE_CAPACITY)
    }

    /// Opens the named device with room for `capacity` messages awaiting delivery.
    pub fn open_with_capacity(
        transport: &dyn Transport,
        device_name: &str,
        capacity: usize,
    ) -> Result<OutputPort, Box<dyn Error>> {
        let connection = transport.connect_output(device_name)?;
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));

        let worker = {
            let device_name = device_name.to_string();
            thread::Builder::new()
                .name(format!("midi out: {}", device_name))
                .spawn(move || deliver(device_name, connection, rx))?
        };

        Ok(OutputPort {
            device_name: device_name.to_string(),
            tx,
            worker: Mutex::new(Some(worker)),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// The number of messages dropped because the delivery queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queues a block of messages for delivery. Each message is due at the time the
    /// call was made plus its offset from `block_position`, converted with the sample
    /// rate. Messages positioned before `block_position` are due immediately. Never blocks.
    pub fn send_block_of_messages(&self, buffer: &MidiBuffer, block_position: usize, sample_rate: f64) {
        let block_start = Instant::now();
        for event in buffer.iter() {
            let offset = event.position.saturating_sub(block_position);
            // Offsets that can't be turned into a deadline are due immediately.
            let deadline = if sample_rate > 0.0 {
                Duration::try_from_secs_f64(offset as f64 / sample_rate)
                    .ok()
                    .and_then(|delay| block_start.checked_add(delay))
                    .unwrap_or(block_start)
            } else {
                block_start
            };

            if self
                .tx
                .try_send(Outgoing::Message {
                    message: event.message,
                    deadline,
                })
                .is_err()
            {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Flushes everything already queued and stops the delivery thread. Safe to call
    /// more than once.
    pub fn close(&self) {
        let worker = match self.worker.lock().take() {
            Some(worker) => worker,
            None => return,
        };

        // Shutdown is queued behind any pending messages, so they go out first.
        if self.tx.send(Outgoing::Shutdown).is_err() {
            debug!(device = self.device_name, "Delivery thread already stopped.");
        }
        if worker.join().is_err() {
            error!(device = self.device_name, "MIDI delivery thread panicked.");
        }

        let dropped = self.dropped();
        if dropped > 0 {
            warn!(
                device = self.device_name,
                dropped, "MIDI output dropped messages because the delivery queue was full."
            );
        }
    }
}

impl Drop for OutputPort {
    fn drop(&mut self) {
        self.close();
    }
}

/// The delivery thread body.
fn deliver(device_name: String, mut connection: Box<dyn OutputConnection>, rx: Receiver<Outgoing>) {
    let span = span!(Level::INFO, "midi delivery");
    let _enter = span.enter();

    debug!(device = device_name, "MIDI delivery started.");
    for outgoing in rx.iter() {
        match outgoing {
            Outgoing::Message { message, deadline } => {
                let now = Instant::now();
                if deadline > now {
                    spin_sleep::sleep(deadline - now);
                }
                if let Err(e) = connection.send(message.bytes()) {
                    error!(
                        device = device_name,
                        err = e.as_ref(),
                        "Error sending MIDI message."
                    );
                }
            }
            Outgoing::Shutdown => break,
        }
    }
    debug!(device = device_name, "MIDI delivery stopped.");
}

/// Binds an output role to at most one open output port.
///
/// The audio thread reads the port through an atomic pointer swap, so replacing or
/// closing the port never tears a read: a block that loaded the old port finishes
/// with it, and the old port is flushed and released on the configuring thread.
pub struct OutputBinding {
    role: OutputRole,
    port: ArcSwapOption<OutputPort>,
    // Held for the whole of an open or close, which serializes reconfiguration.
    device_name: Mutex<String>,
}

impl OutputBinding {
    pub fn new(role: OutputRole) -> OutputBinding {
        OutputBinding {
            role,
            port: ArcSwapOption::empty(),
            device_name: Mutex::new(String::new()),
        }
    }

    /// The bound device name, empty if unbound.
    pub fn device_name(&self) -> String {
        self.device_name.lock().clone()
    }

    pub fn is_bound(&self) -> bool {
        self.port.load().is_some()
    }

    /// Binds the role to the named device, closing any existing port first. Returns
    /// false, leaving the role unbound, if the device isn't enumerated or can't be opened.
    pub fn open(&self, transport: &dyn Transport, device_name: &str) -> bool {
        let span = span!(Level::INFO, "open output", role = ?self.role);
        let _enter = span.enter();

        let mut bound_name = self.device_name.lock();
        self.release(&mut bound_name);

        let available = match transport.output_names() {
            Ok(available) => available,
            Err(e) => {
                warn!(err = e.as_ref(), "Unable to list MIDI outputs.");
                return false;
            }
        };
        if !available.iter().any(|name| name == device_name) {
            warn!(
                device = device_name,
                "MIDI output is not available, leaving role unbound."
            );
            return false;
        }

        match OutputPort::open(transport, device_name) {
            Ok(port) => {
                self.port.store(Some(Arc::new(port)));
                *bound_name = device_name.to_string();
                info!(device = device_name, "MIDI output bound.");
                true
            }
            Err(e) => {
                warn!(
                    device = device_name,
                    err = e.as_ref(),
                    "Unable to open MIDI output, leaving role unbound."
                );
                false
            }
        }
    }

    /// Flushes and releases the port, if any. Safe to call when unbound.
    pub fn close(&self) {
        let mut bound_name = self.device_name.lock();
        self.release(&mut bound_name);
    }

    fn release(&self, bound_name: &mut String) {
        if let Some(port) = self.port.swap(None) {
            port.close();
            info!(role = ?self.role, device = port.device_name(), "MIDI output unbound.");
        }
        bound_name.clear();
    }

    /// Hands a block of messages to the bound port. Does nothing when unbound.
    pub fn send(&self, buffer: &MidiBuffer, block_position: usize, sample_rate: f64) {
        if buffer.is_empty() {
            return;
        }
        if let Some(port) = &*self.port.load() {
            port.send_block_of_messages(buffer, block_position, sample_rate);
        }
    }
}

impl Drop for OutputBinding {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use crate::{
        collector::MidiBuffer,
        midi::{
            message::{control_change, note_on},
            mock,
        },
        routing::OutputRole,
        testutil::eventually,
    };

    use std::time::{Duration, Instant};

    use super::{OutputBinding, OutputPort};

    #[test]
    fn open_send_close() {
        let transport = mock::Transport::get("mock");
        let binding = OutputBinding::new(OutputRole::Thru);
        assert!(binding.open(&transport, "mock-output-1"));
        assert!(binding.is_bound());
        assert_eq!("mock-output-1", binding.device_name());

        let mut buffer = MidiBuffer::default();
        buffer.add_event(note_on(1, 60, 100), 0);
        buffer.add_event(control_change(1, 7, 90), 32);
        binding.send(&buffer, 0, 44100.0);

        // Closing flushes whatever was queued.
        binding.close();
        assert!(!binding.is_bound());
        assert_eq!("", binding.device_name());
        assert_eq!(
            vec![
                note_on(1, 60, 100).bytes().to_vec(),
                control_change(1, 7, 90).bytes().to_vec()
            ],
            transport.sent("mock-output-1")
        );
    }

    #[test]
    fn delivery_happens_in_the_background() {
        let transport = mock::Transport::get("mock");
        let binding = OutputBinding::new(OutputRole::Feedback);
        assert!(binding.open(&transport, "mock-output-2"));

        let mut buffer = MidiBuffer::default();
        buffer.add_event(control_change(2, 1, 1), 0);
        binding.send(&buffer, 0, 48000.0);

        eventually(
            || transport.sent("mock-output-2").len() == 1,
            "Message was never delivered",
        );
    }

    #[test]
    fn unknown_device_reports_failure() {
        let transport = mock::Transport::get("mock");
        let binding = OutputBinding::new(OutputRole::Feedback);
        assert!(!binding.open(&transport, "X"));
        assert!(!binding.is_bound());
        assert_eq!("", binding.device_name());

        // Sending while unbound is a no-op.
        let mut buffer = MidiBuffer::default();
        buffer.add_event(note_on(1, 60, 100), 0);
        binding.send(&buffer, 0, 44100.0);
    }

    #[test]
    fn reopening_releases_the_previous_port() {
        let transport = mock::Transport::get("mock");
        let binding = OutputBinding::new(OutputRole::Thru);
        assert!(binding.open(&transport, "mock-output-1"));
        assert!(binding.open(&transport, "mock-output-2"));
        assert_eq!("mock-output-2", binding.device_name());

        let mut buffer = MidiBuffer::default();
        buffer.add_event(note_on(1, 60, 100), 0);
        binding.send(&buffer, 0, 44100.0);
        binding.close();

        assert!(transport.sent("mock-output-1").is_empty());
        assert_eq!(1, transport.sent("mock-output-2").len());

        // A failed reopen still releases the old port.
        assert!(binding.open(&transport, "mock-output-1"));
        assert!(!binding.open(&transport, "gone"));
        assert!(!binding.is_bound());
    }

    #[test]
    fn unplugged_device_cannot_be_bound() {
        let transport = mock::Transport::get("mock");
        transport.remove_output("mock-output-1");
        let binding = OutputBinding::new(OutputRole::Thru);
        assert!(!binding.open(&transport, "mock-output-1"));
        assert_eq!("", binding.device_name());
        assert!(binding.open(&transport, "mock-output-2"));
    }

    #[test]
    fn full_delivery_queue_drops_and_counts() {
        let transport = mock::Transport::get("mock");
        let port = OutputPort::open_with_capacity(&transport, "mock-output-1", 1)
            .expect("port should open");

        // Every message is due 100ms out, so the delivery thread stalls on the first one.
        let mut buffer = MidiBuffer::default();
        for key in 0..10 {
            buffer.add_event(note_on(1, key, 100), 100);
        }
        let started = Instant::now();
        port.send_block_of_messages(&buffer, 0, 1000.0);
        assert!(started.elapsed() < Duration::from_millis(100));

        // At most one message waits in the queue and one is in the delivery thread.
        let dropped = port.dropped();
        assert!(dropped >= 8, "only {} dropped", dropped);

        port.close();
        assert_eq!(10 - dropped as usize, transport.sent("mock-output-1").len());
    }

    #[test]
    fn unusable_sample_rate_sends_immediately() {
        let transport = mock::Transport::get("mock");
        let port = OutputPort::open(&transport, "mock-output-1").expect("port should open");

        let mut buffer = MidiBuffer::default();
        buffer.add_event(note_on(1, 60, 100), 512);
        port.send_block_of_messages(&buffer, 0, f64::MIN_POSITIVE / 4.0);
        port.close();

        assert_eq!(1, transport.sent("mock-output-1").len());
        assert_eq!(0, port.dropped());
    }
}
