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

use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};
use tracing::{debug, info, warn};

/// Priority for the block clock thread when MIDIROUTE_THREAD_PRIORITY is unset.
const DEFAULT_BLOCK_THREAD_PRIORITY: u8 = 70;

/// Reads MIDIROUTE_THREAD_PRIORITY (0-99), falling back to the default for missing or
/// out of range values.
pub fn block_thread_priority() -> Option<ThreadPriorityValue> {
    std::env::var("MIDIROUTE_THREAD_PRIORITY")
        .ok()
        .and_then(|v| v.parse::<u8>().ok())
        .filter(|n| *n < 100)
        .and_then(|n| ThreadPriorityValue::try_from(n).ok())
        .or_else(|| ThreadPriorityValue::try_from(DEFAULT_BLOCK_THREAD_PRIORITY).ok())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| {
            v == "1"
                || v.eq_ignore_ascii_case("true")
                || v.eq_ignore_ascii_case("yes")
                || v.eq_ignore_ascii_case("on")
        })
        .unwrap_or(false)
}

/// Whether to attempt RT (SCHED_FIFO) scheduling for the block clock thread.
/// Enabled unless MIDIROUTE_DISABLE_RT=1.
pub fn rt_enabled() -> bool {
    !env_flag("MIDIROUTE_DISABLE_RT")
}

/// Raises the priority of the calling thread. Failures are logged and otherwise ignored.
pub fn configure_block_thread_priority(priority: Option<ThreadPriorityValue>, rt: bool) {
    let priority = match priority {
        Some(priority) => priority,
        None => return,
    };
    let tp = ThreadPriority::Crossplatform(priority);
    if let Err(e) = set_current_thread_priority(tp) {
        debug!(error = ?e, "Unable to raise block clock thread priority");
    }

    #[cfg(unix)]
    if rt {
        use thread_priority::unix::{
            set_thread_priority_and_policy, thread_native_id, RealtimeThreadSchedulePolicy,
            ThreadSchedulePolicy,
        };
        match set_thread_priority_and_policy(
            thread_native_id(),
            tp,
            ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
        ) {
            Ok(()) => info!("Enabled RT SCHED_FIFO for block clock thread"),
            Err(e) => warn!(error = %e, "Failed to set RT SCHED_FIFO for block clock thread"),
        }
    }

    #[cfg(not(unix))]
    let _ = rt;
}
