use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};

/// Runs a cleanup closure on a value when it goes out of scope, unless the
/// value is taken back with [`Deferred::undefer`].
///
/// Used while building up Vulkan objects so that an early `?` return tears
/// down whatever was already created.
pub trait Defer: Sized {
    fn defer<F: FnOnce(&Self)>(self, cleanup: F) -> Deferred<Self, F>;
}

impl<T> Defer for T {
    fn defer<F: FnOnce(&Self)>(self, cleanup: F) -> Deferred<Self, F> {
        Deferred {
            value: ManuallyDrop::new(self),
            cleanup: ManuallyDrop::new(cleanup),
        }
    }
}

pub struct Deferred<T, F: FnOnce(&T)> {
    value: ManuallyDrop<T>,
    cleanup: ManuallyDrop<F>,
}

impl<T, F: FnOnce(&T)> Deferred<T, F> {
    /// Disarms the guard and hands the value back.
    pub fn undefer(mut self) -> T {
        // SAFETY: both fields are taken exactly once and `self` is forgotten
        // right after, so Drop never sees them again
        let value = unsafe { ManuallyDrop::take(&mut self.value) };
        unsafe { ManuallyDrop::drop(&mut self.cleanup) };
        std::mem::forget(self);
        value
    }
}

impl<T, F: FnOnce(&T)> Deref for Deferred<T, F> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T, F: FnOnce(&T)> DerefMut for Deferred<T, F> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T, F: FnOnce(&T)> Drop for Deferred<T, F> {
    fn drop(&mut self) {
        // SAFETY: drop runs at most once and undefer forgets self
        let cleanup = unsafe { ManuallyDrop::take(&mut self.cleanup) };
        cleanup(&self.value);
        unsafe { ManuallyDrop::drop(&mut self.value) };
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn cleanup_runs_on_drop() {
        let seen = Cell::new(0);
        {
            let guard = 7.defer(|x| seen.set(*x));
            assert_eq!(*guard, 7);
        }
        assert_eq!(seen.get(), 7);
    }

    #[test]
    fn undefer_skips_cleanup() {
        let ran = Cell::new(false);
        let guard = String::from("surface").defer(|_| ran.set(true));
        let value = guard.undefer();
        assert_eq!(value, "surface");
        assert!(!ran.get());
    }

    #[test]
    fn cleanup_runs_on_early_return() {
        let ran = Cell::new(false);
        let build = || -> Result<u32, ()> {
            let _guard = 1u32.defer(|_| ran.set(true));
            Err(())
        };
        assert!(build().is_err());
        assert!(ran.get());
    }
}
