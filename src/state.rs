//! Shared connectivity state
//!
//! One instance is created by the supervisor and handed to every task as an
//! `Arc`. The watcher is the only writer of the presence flags; the reader
//! and dispatcher only read them. Reads may be up to one poll interval stale.
//! The reader may raise the controller fault flag, which the watcher consumes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Point-in-time copy of the presence flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Presence {
    pub controller: bool,
    pub amp: bool,
}

impl Presence {
    pub fn new(controller: bool, amp: bool) -> Self {
        Self { controller, amp }
    }

    pub fn both(&self) -> bool {
        self.controller && self.amp
    }
}

#[derive(Debug, Default)]
pub struct ConnectivityState {
    controller_present: AtomicBool,
    amp_present: AtomicBool,
    /// Bumped after each completed reconnect
    generation: AtomicU64,
    /// The open controller handle reported that the device is gone
    controller_fault: AtomicBool,
}

impl ConnectivityState {
    pub fn new(initial: Presence) -> Self {
        Self {
            controller_present: AtomicBool::new(initial.controller),
            amp_present: AtomicBool::new(initial.amp),
            generation: AtomicU64::new(0),
            controller_fault: AtomicBool::new(false),
        }
    }

    pub fn controller_present(&self) -> bool {
        self.controller_present.load(Ordering::Acquire)
    }

    pub fn amp_present(&self) -> bool {
        self.amp_present.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Presence {
        Presence {
            controller: self.controller_present(),
            amp: self.amp_present(),
        }
    }

    pub fn set_controller_present(&self, present: bool) {
        self.controller_present.store(present, Ordering::Release);
    }

    pub fn set_amp_present(&self, present: bool) {
        self.amp_present.store(present, Ordering::Release);
    }

    pub fn store(&self, presence: Presence) {
        self.set_controller_present(presence.controller);
        self.set_amp_present(presence.amp);
    }

    /// Current reconnect generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Record a completed reconnect, returning the new generation
    pub fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Report a dead controller handle (replugged faster than a poll)
    pub fn flag_controller_fault(&self) {
        self.controller_fault.store(true, Ordering::Release);
    }

    /// Consume the fault flag, returning whether it was set
    pub fn take_controller_fault(&self) -> bool {
        self.controller_fault.swap(false, Ordering::AcqRel)
    }
}
