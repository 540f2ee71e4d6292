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
use std::{error::Error, fmt};

use midir::{
    Ignore, MidiInput, MidiInputConnection, MidiInputPort, MidiOutput, MidiOutputConnection,
    MidiOutputPort,
};
use parking_lot::Mutex;
use tracing::{debug, info, span, Level};

use super::{DeviceSetup, InputCallback};

/// The device setup key holding the midir client name.
const CLIENT_NAME_KEY: &str = "client";

/// A transport backed by midir.
pub struct Transport {
    client_name: String,
    setup: Mutex<DeviceSetup>,
}

impl Transport {
    /// Creates a new midir transport. Fails if the MIDI backend isn't available.
    pub fn new(client_name: &str) -> Result<Transport, Box<dyn Error>> {
        // Probe the backend so that a missing MIDI subsystem is reported up front.
        MidiInput::new(&format!("{} probe", client_name))?;

        let mut setup = DeviceSetup::default();
        setup.set(CLIENT_NAME_KEY, client_name);
        Ok(Transport {
            client_name: client_name.to_string(),
            setup: Mutex::new(setup),
        })
    }

    fn new_input(&self) -> Result<MidiInput, Box<dyn Error>> {
        let mut input = MidiInput::new(&format!("{} input", self.client_name))?;
        // Realtime transport messages are routed, active sensing never is.
        input.ignore(Ignore::ActiveSense);
        Ok(input)
    }

    fn new_output(&self) -> Result<MidiOutput, Box<dyn Error>> {
        Ok(MidiOutput::new(&format!("{} output", self.client_name))?)
    }
}

/// Finds the input port with exactly the given name.
fn find_input_port(input: &MidiInput, device_name: &str) -> Result<MidiInputPort, Box<dyn Error>> {
    for port in input.ports() {
        if input.port_name(&port)? == device_name {
            return Ok(port);
        }
    }
    Err(format!("no input device found with name {}", device_name).into())
}

/// Finds the output port with exactly the given name.
fn find_output_port(
    output: &MidiOutput,
    device_name: &str,
) -> Result<MidiOutputPort, Box<dyn Error>> {
    for port in output.ports() {
        if output.port_name(&port)? == device_name {
            return Ok(port);
        }
    }
    Err(format!("no output device found with name {}", device_name).into())
}

impl super::Transport for Transport {
    fn input_names(&self) -> Result<Vec<String>, Box<dyn Error>> {
        let input = self.new_input()?;
        input
            .ports()
            .iter()
            .map(|port| input.port_name(port).map_err(|e| e.into()))
            .collect()
    }

    fn output_names(&self) -> Result<Vec<String>, Box<dyn Error>> {
        let output = self.new_output()?;
        output
            .ports()
            .iter()
            .map(|port| output.port_name(port).map_err(|e| e.into()))
            .collect()
    }

    fn connect_input(
        &self,
        device_name: &str,
        mut callback: InputCallback,
    ) -> Result<Box<dyn super::InputConnection>, Box<dyn Error>> {
        let span = span!(Level::INFO, "connect input (midir)");
        let _enter = span.enter();

        let input = self.new_input()?;
        let port = find_input_port(&input, device_name)?;
        let connection = input.connect(
            &port,
            &format!("{} input watcher", self.client_name),
            move |_, raw_event, _| callback(raw_event),
            (),
        )?;

        info!(device = device_name, "Subscribed to MIDI input.");
        Ok(Box::new(InputConnection {
            device_name: device_name.to_string(),
            connection: Some(connection),
        }))
    }

    fn connect_output(
        &self,
        device_name: &str,
    ) -> Result<Box<dyn super::OutputConnection>, Box<dyn Error>> {
        let span = span!(Level::INFO, "connect output (midir)");
        let _enter = span.enter();

        let output = self.new_output()?;
        let port = find_output_port(&output, device_name)?;
        let connection = output.connect(&port, &format!("{} output", self.client_name))?;

        info!(device = device_name, "Opened MIDI output.");
        Ok(Box::new(OutputConnection { connection }))
    }

    fn device_setup(&self) -> Option<DeviceSetup> {
        Some(self.setup.lock().clone())
    }

    fn restore_device_setup(&self, setup: &DeviceSetup) -> Result<(), Box<dyn Error>> {
        *self.setup.lock() = setup.clone();
        Ok(())
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (midir)", self.client_name)
    }
}

struct InputConnection {
    device_name: String,
    connection: Option<MidiInputConnection<()>>,
}

impl super::InputConnection for InputConnection {
    fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl Drop for InputConnection {
    fn drop(&mut self) {
        // Closing joins the backend's callback thread, so no further callbacks happen after this.
        if let Some(connection) = self.connection.take() {
            connection.close();
            debug!(device = self.device_name, "Unsubscribed from MIDI input.");
        }
    }
}

struct OutputConnection {
    connection: MidiOutputConnection,
}

impl super::OutputConnection for OutputConnection {
    fn send(&mut self, bytes: &[u8]) -> Result<(), Box<dyn Error>> {
        self.connection.send(bytes)?;
        Ok(())
    }
}
