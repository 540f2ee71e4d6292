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

//! Message classification: which collectors an incoming message belongs in.

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use serde::Deserialize;

use crate::{
    collector::{Collectors, MessageCollector},
    midi::Message,
};

/// The purpose of an input binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InputRole {
    /// Note performance data.
    Notes,
    /// Continuous controller data.
    Cc,
}

impl InputRole {
    pub const ALL: [InputRole; 2] = [InputRole::Notes, InputRole::Cc];
}

/// The purpose of an output binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputRole {
    /// Pass-through of incoming performance data.
    Thru,
    /// Controller feedback, e.g. for motorized faders or LED rings.
    Feedback,
}

impl OutputRole {
    pub const ALL: [OutputRole; 2] = [OutputRole::Thru, OutputRole::Feedback];
}

/// The message buffers a message can be routed into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrafficClass {
    CcInput,
    CcFeedback,
    NoteInput,
    Thru,
}

impl TrafficClass {
    pub const ALL: [TrafficClass; 4] = [
        TrafficClass::CcInput,
        TrafficClass::CcFeedback,
        TrafficClass::NoteInput,
        TrafficClass::Thru,
    ];

    fn bit(self) -> u8 {
        match self {
            TrafficClass::CcInput => 1,
            TrafficClass::CcFeedback => 1 << 1,
            TrafficClass::NoteInput => 1 << 2,
            TrafficClass::Thru => 1 << 3,
        }
    }
}

/// A set of traffic classes. Copyable so classification never allocates.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficClasses(u8);

impl TrafficClasses {
    /// The empty set: the message is discarded.
    pub const NONE: TrafficClasses = TrafficClasses(0);

    /// Returns the set with the given class added.
    pub fn with(self, class: TrafficClass) -> TrafficClasses {
        TrafficClasses(self.0 | class.bit())
    }

    pub fn contains(self, class: TrafficClass) -> bool {
        self.0 & class.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates over the classes in the set in a fixed order.
    pub fn iter(self) -> impl Iterator<Item = TrafficClass> {
        TrafficClass::ALL
            .into_iter()
            .filter(move |class| self.contains(*class))
    }
}

impl fmt::Debug for TrafficClasses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Whether the router runs as its own process or embedded in a host.
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Running as its own process. Transport control messages on the note input are routed.
    #[default]
    Standalone,
    /// Embedded in a plugin host, which owns the transport. Transport control messages are dropped.
    Plugin,
}

/// A point in time copy of the routing flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoutingSnapshot {
    /// Note input is mirrored to the pass-through collector.
    pub thru: bool,
    /// Controller messages on the note device are treated as controller data.
    pub use_note_device_for_cc: bool,
    /// Reserved: mirror of the controller device to pass-through. Stored but not routed on.
    pub cc_input_thru: bool,
}

/// Routing flags. Changed from the configuration side, read on every incoming message.
#[derive(Default)]
pub struct RoutingFlags {
    thru: AtomicBool,
    use_note_device_for_cc: AtomicBool,
    cc_input_thru: AtomicBool,
}

impl RoutingFlags {
    pub fn new(snapshot: RoutingSnapshot) -> RoutingFlags {
        RoutingFlags {
            thru: AtomicBool::new(snapshot.thru),
            use_note_device_for_cc: AtomicBool::new(snapshot.use_note_device_for_cc),
            cc_input_thru: AtomicBool::new(snapshot.cc_input_thru),
        }
    }

    pub fn snapshot(&self) -> RoutingSnapshot {
        RoutingSnapshot {
            thru: self.thru.load(Ordering::Relaxed),
            use_note_device_for_cc: self.use_note_device_for_cc.load(Ordering::Relaxed),
            cc_input_thru: self.cc_input_thru.load(Ordering::Relaxed),
        }
    }

    pub fn set_thru(&self, enabled: bool) {
        self.thru.store(enabled, Ordering::Relaxed);
    }

    pub fn set_use_note_device_for_cc(&self, enabled: bool) {
        self.use_note_device_for_cc.store(enabled, Ordering::Relaxed);
    }

    pub fn set_cc_input_thru(&self, enabled: bool) {
        self.cc_input_thru.store(enabled, Ordering::Relaxed);
    }
}

/// Decides which traffic classes a message arriving on the given input role belongs to.
pub fn classify(
    role: InputRole,
    message: &Message,
    flags: RoutingSnapshot,
    mode: TransportMode,
) -> TrafficClasses {
    match role {
        InputRole::Cc => {
            if message.is_controller() {
                TrafficClasses::NONE.with(TrafficClass::CcInput)
            } else {
                TrafficClasses::NONE
            }
        }
        InputRole::Notes => {
            if mode == TransportMode::Standalone && message.is_transport_control() {
                return TrafficClasses::NONE.with(TrafficClass::NoteInput);
            }

            let classes = if message.is_note_on_or_off() {
                TrafficClasses::NONE.with(TrafficClass::NoteInput)
            } else if flags.use_note_device_for_cc && message.is_controller() {
                TrafficClasses::NONE.with(TrafficClass::CcInput)
            } else {
                return TrafficClasses::NONE;
            };

            if flags.thru {
                classes.with(TrafficClass::Thru)
            } else {
                classes
            }
        }
    }
}

/// Classifies incoming messages and appends them to the collectors.
pub struct Router {
    flags: RoutingFlags,
    mode: TransportMode,
    collectors: Collectors,
}

impl Router {
    pub fn new(flags: RoutingSnapshot, mode: TransportMode, collector_capacity: usize) -> Router {
        Router {
            flags: RoutingFlags::new(flags),
            mode,
            collectors: Collectors::new(collector_capacity),
        }
    }

    pub fn flags(&self) -> &RoutingFlags {
        &self.flags
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn collectors(&self) -> &Collectors {
        &self.collectors
    }

    pub fn collector(&self, class: TrafficClass) -> &MessageCollector {
        self.collectors.get(class)
    }

    /// Routes a message. Runs on the transport's callback thread, so it only
    /// classifies and enqueues.
    pub fn route(&self, role: InputRole, message: &Message) -> TrafficClasses {
        let classes = classify(role, message, self.flags.snapshot(), self.mode);
        for class in classes.iter() {
            self.collectors.get(class).add_message_to_queue(*message);
        }
        classes
    }
}
