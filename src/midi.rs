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
use std::{collections::BTreeMap, error::Error, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

pub mod message;
mod midir;
pub mod mock;

pub use message::Message;

/// Called by the transport once per incoming message, on the transport's own thread.
pub type InputCallback = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// An open subscription to an input device. Dropping it unsubscribes the callback.
pub trait InputConnection: Send {
    /// The device this connection is subscribed to.
    fn device_name(&self) -> &str;
}

/// An open output device.
pub trait OutputConnection: Send {
    /// Writes the raw message bytes to the device.
    fn send(&mut self, bytes: &[u8]) -> Result<(), Box<dyn Error>>;
}

/// The transport's own device setup. It is not interpreted here, only stored and
/// handed back to the transport when restoring.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceSetup(BTreeMap<String, String>);

impl DeviceSetup {
    /// Returns the value stored under the given key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Stores a value under the given key.
    pub fn set(&mut self, key: &str, value: &str) {
        self.0.insert(key.to_string(), value.to_string());
    }
}

/// The MIDI transport: device enumeration and byte level I/O.
pub trait Transport: fmt::Display + Send + Sync {
    /// Lists the names of the available input devices.
    fn input_names(&self) -> Result<Vec<String>, Box<dyn Error>>;

    /// Lists the names of the available output devices.
    fn output_names(&self) -> Result<Vec<String>, Box<dyn Error>>;

    /// Subscribes the callback to the named input device.
    fn connect_input(
        &self,
        device_name: &str,
        callback: InputCallback,
    ) -> Result<Box<dyn InputConnection>, Box<dyn Error>>;

    /// Opens the named output device.
    fn connect_output(&self, device_name: &str) -> Result<Box<dyn OutputConnection>, Box<dyn Error>>;

    /// Returns a snapshot of the transport's device setup, if one is available.
    fn device_setup(&self) -> Option<DeviceSetup>;

    /// Restores a previously saved device setup.
    fn restore_device_setup(&self, setup: &DeviceSetup) -> Result<(), Box<dyn Error>>;
}

/// Gets a transport with the given name.
pub fn get_transport(name: &str) -> Result<Arc<dyn Transport>, Box<dyn Error>> {
    if name.starts_with("mock") {
        return Ok(Arc::new(mock::Transport::get(name)));
    };

    Ok(Arc::new(midir::Transport::new(name)?))
}
