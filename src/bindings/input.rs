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
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tracing::{info, span, warn, Level};

use crate::{
    midi::{InputConnection, Message, Transport},
    routing::{InputRole, Router},
};

/// The callback object for one input role. Every subscription of the role hands
/// its raw bytes to this object, which decodes them and routes them.
pub struct RoleCallback {
    role: InputRole,
    router: Arc<Router>,
}

impl RoleCallback {
    pub fn new(role: InputRole, router: Arc<Router>) -> RoleCallback {
        RoleCallback { role, router }
    }

    pub fn role(&self) -> InputRole {
        self.role
    }

    /// Handles raw bytes from the transport. Undecodable input is dropped.
    pub fn handle_incoming_midi_message(&self, raw_event: &[u8]) {
        if let Some(message) = Message::from_bytes(raw_event) {
            self.router.route(self.role, &message);
        }
    }
}

/// A live subscription of the role callback to one device.
struct Subscription {
    device_name: String,
    active: Arc<AtomicBool>,
    // Dropping the connection unsubscribes from the transport.
    _connection: Box<dyn InputConnection>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Stop forwarding before the transport connection goes away, in case the
        // backend delivers one more message while it shuts down.
        self.active.store(false, Ordering::Release);
    }
}

/// Binds an input role to at most one device.
pub struct InputBinding {
    callback: Arc<RoleCallback>,
    subscription: Option<Subscription>,
}

impl InputBinding {
    pub fn new(callback: Arc<RoleCallback>) -> InputBinding {
        InputBinding {
            callback,
            subscription: None,
        }
    }

    pub fn role(&self) -> InputRole {
        self.callback.role()
    }

    /// The bound device name, empty if unbound.
    pub fn device_name(&self) -> &str {
        self.subscription
            .as_ref()
            .map(|subscription| subscription.device_name.as_str())
            .unwrap_or("")
    }

    pub fn is_bound(&self) -> bool {
        self.subscription.is_some()
    }

    /// Binds the role to the named device, closing any existing binding first. If the
    /// device isn't enumerated or can't be opened, the role is left unbound.
    pub fn open(&mut self, transport: &dyn Transport, device_name: &str) {
        let span = span!(Level::INFO, "open input", role = ?self.role());
        let _enter = span.enter();

        self.close();

        let available = match transport.input_names() {
            Ok(available) => available,
            Err(e) => {
                warn!(err = e.as_ref(), "Unable to list MIDI inputs.");
                return;
            }
        };
        if !available.iter().any(|name| name == device_name) {
            warn!(
                device = device_name,
                "MIDI input is not available, leaving role unbound."
            );
            return;
        }

        let active = Arc::new(AtomicBool::new(true));
        let forward = {
            let callback = self.callback.clone();
            let active = active.clone();
            Box::new(move |raw_event: &[u8]| {
                if active.load(Ordering::Acquire) {
                    callback.handle_incoming_midi_message(raw_event);
                }
            })
        };

        match transport.connect_input(device_name, forward) {
            Ok(connection) => {
                info!(device = device_name, "MIDI input bound.");
                self.subscription = Some(Subscription {
                    device_name: device_name.to_string(),
                    active,
                    _connection: connection,
                });
            }
            Err(e) => warn!(
                device = device_name,
                err = e.as_ref(),
                "Unable to open MIDI input, leaving role unbound."
            ),
        }
    }

    /// Unsubscribes the role from whatever device it is bound to. Safe to call when unbound.
    pub fn close(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            info!(
                role = ?self.role(),
                device = subscription.device_name,
                "MIDI input unbound."
            );
        }
    }
}

impl Drop for InputBinding {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crate::{
        midi::{message::note_on, mock},
        routing::{InputRole, Router, RoutingSnapshot, TrafficClass, TransportMode},
    };

    use super::{InputBinding, RoleCallback};

    fn binding(role: InputRole) -> (InputBinding, Arc<Router>) {
        let router = Arc::new(Router::new(
            RoutingSnapshot::default(),
            TransportMode::Standalone,
            64,
        ));
        (
            InputBinding::new(Arc::new(RoleCallback::new(role, router.clone()))),
            router,
        )
    }

    #[test]
    fn open_and_close() {
        let transport = mock::Transport::get("mock");
        let (mut binding, router) = binding(InputRole::Notes);
        assert!(!binding.is_bound());

        binding.open(&transport, "mock-input-1");
        assert!(binding.is_bound());
        assert_eq!("mock-input-1", binding.device_name());
        assert_eq!(1, transport.subscriber_count("mock-input-1"));

        transport.inject("mock-input-1", note_on(1, 60, 100).bytes());
        assert_eq!(1, router.collector(TrafficClass::NoteInput).pending());

        binding.close();
        assert_eq!("", binding.device_name());
        assert_eq!(0, transport.subscriber_count("mock-input-1"));

        binding.close();
        assert_eq!("", binding.device_name());
    }

    #[test]
    fn missing_device_leaves_role_unbound() {
        let transport = mock::Transport::get("mock");
        let (mut binding, _) = binding(InputRole::Cc);

        binding.open(&transport, "mock-input-1");
        binding.open(&transport, "not plugged in");
        assert!(!binding.is_bound());
        assert_eq!("", binding.device_name());
        assert_eq!(0, transport.subscriber_count("mock-input-1"));
    }

    #[test]
    fn dropping_the_binding_unsubscribes() {
        let transport = mock::Transport::get("mock");
        let (mut binding, _) = binding(InputRole::Notes);
        binding.open(&transport, "mock-input-2");
        assert_eq!(1, transport.subscriber_count("mock-input-2"));

        drop(binding);
        assert_eq!(0, transport.subscriber_count("mock-input-2"));
    }

    #[test]
    fn unplugged_device_is_still_unsubscribed() {
        let transport = mock::Transport::get("mock");
        let (mut binding, _) = binding(InputRole::Notes);
        binding.open(&transport, "mock-input-2");

        transport.remove_input("mock-input-2");
        binding.close();
        assert_eq!(0, transport.subscriber_count("mock-input-2"));
    }
}
