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
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::{debug, info, span, warn, Level};

use crate::{
    bindings::{InputBinding, OutputBinding, RoleCallback},
    collector::{MessageCollector, MidiBuffer},
    config::Settings,
    midi::{Message, Transport},
    persistence::{self, DevicesDocument, PersistError, DEVICES_FILE, VERSION_TAG},
    routing::{
        InputRole, OutputRole, Router, RoutingFlags, TrafficClass, TrafficClasses, TransportMode,
    },
};

/// Owns the MIDI bindings and collectors for one audio engine.
///
/// Reconfiguration (opening and closing ports, save and restore) is meant for a
/// non-realtime thread. `collect_incoming_midi_messages` runs on transport callback
/// threads, the collectors are drained and the `send_*` functions are called from
/// the audio thread once per block.
pub struct DeviceManager {
    transport: Arc<dyn Transport>,
    router: Arc<Router>,
    notes: Mutex<InputBinding>,
    cc: Mutex<InputBinding>,
    thru: OutputBinding,
    feedback: OutputBinding,
    // f64 bits.
    sample_rate: AtomicU64,
    settings_dir: PathBuf,
}

impl DeviceManager {
    /// Creates a manager with every role unbound.
    pub fn new(transport: Arc<dyn Transport>, settings: &Settings) -> DeviceManager {
        let router = Arc::new(Router::new(
            settings.routing(),
            settings.mode(),
            settings.collector_capacity(),
        ));
        let input_binding = |role| {
            Mutex::new(InputBinding::new(Arc::new(RoleCallback::new(
                role,
                router.clone(),
            ))))
        };

        let manager = DeviceManager {
            transport,
            notes: input_binding(InputRole::Notes),
            cc: input_binding(InputRole::Cc),
            router,
            thru: OutputBinding::new(OutputRole::Thru),
            feedback: OutputBinding::new(OutputRole::Feedback),
            sample_rate: AtomicU64::new(f64::from(settings.sample_rate()).to_bits()),
            settings_dir: settings.settings_dir(),
        };
        manager.sample_rate_changed(0.0);
        manager
    }

    pub fn mode(&self) -> TransportMode {
        self.router.mode()
    }

    /// The routing flags, which can be changed while messages are flowing.
    pub fn routing(&self) -> &RoutingFlags {
        self.router.flags()
    }

    pub fn collector(&self, class: TrafficClass) -> &MessageCollector {
        self.router.collector(class)
    }

    pub fn sample_rate(&self) -> f64 {
        f64::from_bits(self.sample_rate.load(Ordering::Relaxed))
    }

    /// Updates the sample rate, resetting the collectors if it changed. Zero means no
    /// rate yet. Negative, non-finite or subnormal rates are ignored.
    pub fn set_sample_rate(&self, sample_rate: f64) {
        if sample_rate != 0.0 && !(sample_rate.is_normal() && sample_rate > 0.0) {
            warn!(sample_rate, "Ignoring unusable sample rate.");
            return;
        }

        let old_rate = f64::from_bits(
            self.sample_rate
                .swap(sample_rate.to_bits(), Ordering::Relaxed),
        );
        if old_rate != sample_rate {
            self.sample_rate_changed(old_rate);
        }
    }

    /// Resets every collector to the current sample rate. Pending messages are discarded.
    pub fn sample_rate_changed(&self, old_rate: f64) {
        let sample_rate = self.sample_rate();
        debug!(old_rate, sample_rate, "Sample rate changed.");
        self.router.collectors().reset_all(sample_rate);
    }

    /// Logs how many messages each collector evicted on overflow, returning the total.
    pub fn report_evictions(&self) -> u64 {
        self.router.collectors().report_evictions()
    }

    /// Routes a message that arrived on the given role into the collectors.
    pub fn collect_incoming_midi_messages(&self, role: InputRole, message: &Message) -> TrafficClasses {
        self.router.route(role, message)
    }

    /// The names of the input devices currently enumerated by the transport.
    pub fn get_available_in_ports(&self) -> Vec<String> {
        self.transport.input_names().unwrap_or_else(|e| {
            warn!(err = e.as_ref(), "Unable to list MIDI inputs.");
            Vec::new()
        })
    }

    /// The names of the output devices currently enumerated by the transport.
    pub fn get_available_out_ports(&self) -> Vec<String> {
        self.transport.output_names().unwrap_or_else(|e| {
            warn!(err = e.as_ref(), "Unable to list MIDI outputs.");
            Vec::new()
        })
    }

    fn input_binding(&self, role: InputRole) -> &Mutex<InputBinding> {
        match role {
            InputRole::Notes => &self.notes,
            InputRole::Cc => &self.cc,
        }
    }

    fn output_binding(&self, role: OutputRole) -> &OutputBinding {
        match role {
            OutputRole::Thru => &self.thru,
            OutputRole::Feedback => &self.feedback,
        }
    }

    /// Binds the input role to the named device. An unknown device leaves the role unbound.
    pub fn open_in_port(&self, role: InputRole, device_name: &str) {
        self.input_binding(role)
            .lock()
            .open(self.transport.as_ref(), device_name);
    }

    pub fn close_in_port(&self, role: InputRole) {
        self.input_binding(role).lock().close();
    }

    /// The device bound to the input role, empty if unbound.
    pub fn get_selected_in_device(&self, role: InputRole) -> String {
        self.input_binding(role).lock().device_name().to_string()
    }

    /// Binds the output role to the named device. Returns false, leaving the role
    /// unbound, if the device can't be found or opened.
    pub fn open_out_port(&self, role: OutputRole, device_name: &str) -> bool {
        self.output_binding(role)
            .open(self.transport.as_ref(), device_name)
    }

    pub fn close_out_port(&self, role: OutputRole) {
        self.output_binding(role).close();
    }

    /// The device bound to the output role, empty if unbound.
    pub fn get_selected_out_device(&self, role: OutputRole) -> String {
        self.output_binding(role).device_name()
    }

    /// Hands a block of pass-through messages to the thru output, if bound.
    pub fn send_thru_messages(&self, buffer: &MidiBuffer, block_position: usize) {
        self.thru.send(buffer, block_position, self.sample_rate());
    }

    /// Hands a block of feedback messages to the feedback output, if bound.
    pub fn send_feedback_messages(&self, buffer: &MidiBuffer, block_position: usize) {
        self.feedback.send(buffer, block_position, self.sample_rate());
    }

    /// Stores the current selection and the transport's device setup in the document.
    pub fn save_to(&self, document: &mut DevicesDocument) -> Result<(), PersistError> {
        let setup = self
            .transport
            .device_setup()
            .ok_or(PersistError::NoDeviceSetup)?;

        document.stamp();
        document.set_device_setup(setup);
        for role in InputRole::ALL {
            document.set_input_device(role, &self.get_selected_in_device(role));
        }
        for role in OutputRole::ALL {
            document.set_output_device(role, &self.get_selected_out_device(role));
        }
        Ok(())
    }

    /// Restores a selection from the document. Roles with no stored device are left
    /// as they are. A document with a missing or different version tag changes nothing.
    pub fn read_from(&self, document: &DevicesDocument) -> Result<(), PersistError> {
        let span = span!(Level::INFO, "restore devices");
        let _enter = span.enter();

        match document.tag() {
            "" => return Err(PersistError::Invalid),
            VERSION_TAG => {}
            found => {
                return Err(PersistError::WrongVersion {
                    found: found.to_string(),
                })
            }
        }

        let mut result = Ok(());
        if self.mode() == TransportMode::Standalone {
            if let Some(setup) = document.device_setup() {
                if let Err(e) = self.transport.restore_device_setup(setup) {
                    warn!(err = e.as_ref(), "Unable to restore the device setup.");
                    result = Err(PersistError::DeviceSetup(e.to_string()));
                }
            }
        }

        for role in InputRole::ALL {
            match document.input_device(role) {
                Some(device_name) if !device_name.is_empty() => {
                    self.open_in_port(role, device_name)
                }
                _ => {}
            }
        }
        for role in OutputRole::ALL {
            match document.output_device(role) {
                Some(device_name) if !device_name.is_empty() => {
                    self.open_out_port(role, device_name);
                }
                _ => {}
            }
        }

        result
    }

    /// The path of the devices file.
    pub fn devices_file(&self) -> PathBuf {
        self.settings_dir.join(DEVICES_FILE)
    }

    /// Saves the selection to the devices file.
    pub fn save(&self) -> Result<(), PersistError> {
        let mut document = DevicesDocument::new();
        self.save_to(&mut document)?;

        let path = self.devices_file();
        persistence::write_document(&path, &document)?;
        info!(path = %path.display(), "Saved MIDI device selection.");
        Ok(())
    }

    /// Restores the selection from the devices file.
    pub fn read(&self) -> Result<(), PersistError> {
        fs::create_dir_all(&self.settings_dir)?;
        let document = persistence::read_document(&self.devices_file())?;
        self.read_from(&document)
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        // Inputs first so nothing new is collected while outputs flush.
        InputRole::ALL
            .iter()
            .for_each(|role| self.close_in_port(*role));
        OutputRole::ALL
            .iter()
            .for_each(|role| self.close_out_port(*role));
        self.report_evictions();
    }
}
