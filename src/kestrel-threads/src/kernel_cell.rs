//! This module provides a Mutex-protected [`RefCell`] --- basically a way to ensure
//! at runtime that the kernel state is borrowed only once, and only inside a
//! critical section.
use core::cell::{Ref, RefCell, RefMut};
use critical_section::{CriticalSection, Mutex};

use crate::critical;

pub(crate) struct KernelCell<T> {
    inner: Mutex<RefCell<T>>,
}

impl<T> KernelCell<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(inner)),
        }
    }

    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(Ref<T>) -> R,
    {
        let guard = critical::enter();
        let result = self.with_cs(guard.cs(), f);
        critical::exit(guard);
        result
    }

    pub fn with_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(RefMut<T>) -> R,
    {
        let guard = critical::enter();
        let result = self.with_mut_cs(guard.cs(), f);
        critical::exit(guard);
        result
    }

    pub fn with_cs<F, R>(&self, cs: CriticalSection, f: F) -> R
    where
        F: FnOnce(Ref<T>) -> R,
    {
        f(self.inner.borrow(cs).borrow())
    }

    pub fn with_mut_cs<F, R>(&self, cs: CriticalSection, f: F) -> R
    where
        F: FnOnce(RefMut<T>) -> R,
    {
        f(self.inner.borrow(cs).borrow_mut())
    }

    /// Raw access for the context switch handler, which runs with interrupts
    /// disabled and must not go through the `RefCell`.
    #[allow(dead_code)]
    pub fn as_ptr(&self, cs: CriticalSection) -> *mut T {
        self.inner.borrow(cs).as_ptr()
    }
}
