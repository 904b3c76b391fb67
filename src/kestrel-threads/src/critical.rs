//! Interrupt-safe critical sections.
//!
//! Thin wrapper around [`critical_section::acquire`]/[`critical_section::release`]
//! that keeps the restore token next to the [`CriticalSection`] it grants, so
//! nested sections restore exactly the state their matching `enter` captured.

use core::marker::PhantomData;

use critical_section::{CriticalSection, RestoreState};

/// An entered critical section.
///
/// Leaving happens on [`exit`] or when the guard is dropped.
pub struct Guard {
    restore: RestoreState,
    // Must be released on the CPU context that acquired it.
    _not_send: PhantomData<*mut ()>,
}

/// Disables preemption and returns the prior state.
#[must_use]
pub fn enter() -> Guard {
    // SAFETY: the token is released exactly once, in `Drop`.
    let restore = unsafe { critical_section::acquire() };
    Guard {
        restore,
        _not_send: PhantomData,
    }
}

/// Restores the state captured by the matching [`enter`].
pub fn exit(guard: Guard) {
    drop(guard);
}

impl Guard {
    /// Token proving that the critical section is held.
    pub fn cs(&self) -> CriticalSection<'_> {
        // SAFETY: `self` is only alive while the section is held.
        unsafe { CriticalSection::new() }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        // SAFETY: `restore` came from the matching `acquire`, and sections are
        // released in reverse order because guards are scoped values.
        unsafe { critical_section::release(self.restore) }
    }
}
