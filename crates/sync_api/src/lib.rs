//! A minimal lock abstraction.
//!
//! Library crates in this workspace run both inside the kernel (where the
//! lock is a spinlock) and in host test binaries (where the lock is
//! [`std::sync::Mutex`]). They stay portable by being generic over this
//! trait instead of naming a concrete lock type.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

use core::ops::DerefMut;

/// A mutual-exclusion primitive protecting a value of type `Data`.
pub trait Mutex {
    /// The type of the data that the mutex protects.
    type Data;

    /// The type of the guard that the `lock` method returns.
    type Guard<'a>: DerefMut<Target = Self::Data>
    where
        Self: 'a;

    /// Creates a new mutex.
    fn new(data: Self::Data) -> Self;

    /// Locks the mutex.
    fn lock(&self) -> Self::Guard<'_>;
}

#[cfg(feature = "spin")]
impl<T> Mutex for spin::Mutex<T> {
    type Data = T;

    type Guard<'a>
        = spin::MutexGuard<'a, T>
    where
        Self: 'a;

    fn new(data: Self::Data) -> Self {
        Self::new(data)
    }

    fn lock(&self) -> Self::Guard<'_> {
        Self::lock(self)
    }
}

/// [`std::sync::Mutex`] behind the [`Mutex`] trait, for host-side tests.
///
/// Lock poisoning has no equivalent in the kernel locks this stands in
/// for, so `lock` propagates a poison panic.
#[cfg(any(test, feature = "std"))]
pub struct StdMutex<T>(std::sync::Mutex<T>);

#[cfg(any(test, feature = "std"))]
pub struct StdMutexGuard<'a, T>(std::sync::MutexGuard<'a, T>);

#[cfg(any(test, feature = "std"))]
impl<T> Mutex for StdMutex<T> {
    type Data = T;

    type Guard<'a>
        = StdMutexGuard<'a, T>
    where
        Self: 'a;

    fn new(data: Self::Data) -> Self {
        Self(std::sync::Mutex::new(data))
    }

    fn lock(&self) -> Self::Guard<'_> {
        StdMutexGuard(self.0.lock().unwrap())
    }
}

#[cfg(any(test, feature = "std"))]
impl<T> core::ops::Deref for StdMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(any(test, feature = "std"))]
impl<T> DerefMut for StdMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
