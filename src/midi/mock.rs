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
use std::{collections::HashMap, error::Error, fmt, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{DeviceSetup, InputCallback};

/// Input devices every mock transport starts with.
pub const DEFAULT_INPUTS: [&str; 2] = ["mock-input-1", "mock-input-2"];

/// Output devices every mock transport starts with.
pub const DEFAULT_OUTPUTS: [&str; 2] = ["mock-output-1", "mock-output-2"];

struct Subscriber {
    id: u64,
    device_name: String,
    callback: InputCallback,
}

#[derive(Default)]
struct State {
    inputs: Vec<String>,
    outputs: Vec<String>,
    subscribers: Vec<Subscriber>,
    next_id: u64,
    sent: HashMap<String, Vec<Vec<u8>>>,
    setup: Option<DeviceSetup>,
    refuse_setup: bool,
}

/// A mock transport. Devices are plain names, input is injected by tests and
/// output is recorded per device.
#[derive(Clone)]
pub struct Transport {
    name: String,
    state: Arc<Mutex<State>>,
}

impl Transport {
    /// Gets a mock transport populated with the default devices.
    pub fn get(name: &str) -> Transport {
        let transport = Transport {
            name: name.to_string(),
            state: Arc::new(Mutex::new(State {
                setup: Some(DeviceSetup::default()),
                ..Default::default()
            })),
        };
        DEFAULT_INPUTS
            .iter()
            .for_each(|device| transport.add_input(device));
        DEFAULT_OUTPUTS
            .iter()
            .for_each(|device| transport.add_output(device));
        transport
    }

    /// Plugs in an input device.
    pub fn add_input(&self, device_name: &str) {
        self.state.lock().inputs.push(device_name.to_string());
    }

    /// Plugs in an output device.
    pub fn add_output(&self, device_name: &str) {
        self.state.lock().outputs.push(device_name.to_string());
    }

    /// Unplugs an input device. Existing subscriptions stay in place but the device
    /// is no longer enumerated, the same way hardware disappears.
    pub fn remove_input(&self, device_name: &str) {
        self.state.lock().inputs.retain(|name| name != device_name);
    }

    /// Unplugs an output device.
    pub fn remove_output(&self, device_name: &str) {
        self.state.lock().outputs.retain(|name| name != device_name);
    }

    /// Delivers raw bytes from the named input device to every subscribed callback.
    /// Returns the number of callbacks invoked.
    pub fn inject(&self, device_name: &str, raw_event: &[u8]) -> usize {
        let mut state = self.state.lock();
        let mut delivered = 0;
        for subscriber in state
            .subscribers
            .iter_mut()
            .filter(|subscriber| subscriber.device_name == device_name)
        {
            (subscriber.callback)(raw_event);
            delivered += 1;
        }
        delivered
    }

    /// The number of callbacks currently subscribed to the named input device.
    pub fn subscriber_count(&self, device_name: &str) -> usize {
        self.state
            .lock()
            .subscribers
            .iter()
            .filter(|subscriber| subscriber.device_name == device_name)
            .count()
    }

    /// Everything written to the named output device so far.
    pub fn sent(&self, device_name: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .sent
            .get(device_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Replaces the device setup snapshot. None simulates a transport that has no
    /// setup to report.
    pub fn set_device_setup(&self, setup: Option<DeviceSetup>) {
        self.state.lock().setup = setup;
    }

    /// Makes restoring a device setup fail.
    pub fn refuse_device_setup(&self, refuse: bool) {
        self.state.lock().refuse_setup = refuse;
    }
}

impl super::Transport for Transport {
    fn input_names(&self) -> Result<Vec<String>, Box<dyn Error>> {
        Ok(self.state.lock().inputs.clone())
    }

    fn output_names(&self) -> Result<Vec<String>, Box<dyn Error>> {
        Ok(self.state.lock().outputs.clone())
    }

    fn connect_input(
        &self,
        device_name: &str,
        callback: InputCallback,
    ) -> Result<Box<dyn super::InputConnection>, Box<dyn Error>> {
        let mut state = self.state.lock();
        if !state.inputs.iter().any(|name| name == device_name) {
            return Err(format!("no input device found with name {}", device_name).into());
        }

        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push(Subscriber {
            id,
            device_name: device_name.to_string(),
            callback,
        });

        info!(device = device_name, "Subscribed to mock input.");
        Ok(Box::new(InputConnection {
            id,
            device_name: device_name.to_string(),
            state: self.state.clone(),
        }))
    }

    fn connect_output(
        &self,
        device_name: &str,
    ) -> Result<Box<dyn super::OutputConnection>, Box<dyn Error>> {
        let state = self.state.lock();
        if !state.outputs.iter().any(|name| name == device_name) {
            return Err(format!("no output device found with name {}", device_name).into());
        }

        info!(device = device_name, "Opened mock output.");
        Ok(Box::new(OutputConnection {
            device_name: device_name.to_string(),
            state: self.state.clone(),
        }))
    }

    fn device_setup(&self) -> Option<DeviceSetup> {
        self.state.lock().setup.clone()
    }

    fn restore_device_setup(&self, setup: &DeviceSetup) -> Result<(), Box<dyn Error>> {
        let mut state = self.state.lock();
        if state.refuse_setup {
            return Err("mock transport refused the device setup".into());
        }
        state.setup = Some(setup.clone());
        Ok(())
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}

struct InputConnection {
    id: u64,
    device_name: String,
    state: Arc<Mutex<State>>,
}

impl super::InputConnection for InputConnection {
    fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl Drop for InputConnection {
    fn drop(&mut self) {
        // Injection holds the same lock, so once this returns the callback is never invoked again.
        self.state
            .lock()
            .subscribers
            .retain(|subscriber| subscriber.id != self.id);
        debug!(device = self.device_name, "Unsubscribed from mock input.");
    }
}

struct OutputConnection {
    device_name: String,
    state: Arc<Mutex<State>>,
}

impl super::OutputConnection for OutputConnection {
    fn send(&mut self, bytes: &[u8]) -> Result<(), Box<dyn Error>> {
        self.state
            .lock()
            .sent
            .entry(self.device_name.clone())
            .or_default()
            .push(bytes.to_vec());
        Ok(())
    }
}
