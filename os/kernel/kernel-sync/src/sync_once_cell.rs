use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

const UNINIT: u8 = 0;
const INITING: u8 = 1;
const READY: u8 = 2;

/// A write-once cell safe to share between CPUs.
///
/// The boot CPU publishes the memory manager here exactly once; every later
/// reader gets a shared reference without locking.
pub struct SyncOnceCell<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncOnceCell<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Returns `Some(&T)` if already initialized.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // Safety: READY guarantees the write happened-before.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// Store `value` if the cell is empty; otherwise hand it back.
    ///
    /// Waits for a concurrent initializer to finish before reporting failure.
    pub fn set(&self, value: T) -> Result<&T, T> {
        if self
            .state
            .compare_exchange(UNINIT, INITING, Ordering::Acquire, Ordering::Acquire)
            .is_ok()
        {
            Ok(self.publish(value))
        } else {
            self.wait_ready();
            Err(value)
        }
    }

    /// Initialize at most once and return `&T`.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if let Some(v) = self.get() {
            return v;
        }

        if self
            .state
            .compare_exchange(UNINIT, INITING, Ordering::Acquire, Ordering::Acquire)
            .is_ok()
        {
            return self.publish(init());
        }

        self.wait_ready()
    }

    fn publish(&self, value: T) -> &T {
        // Safety: INITING is held by this caller only.
        let v = unsafe { (*self.value.get()).write(value) };
        self.state.store(READY, Ordering::Release);
        v
    }

    fn wait_ready(&self) -> &T {
        while self.state.load(Ordering::Acquire) != READY {
            spin_loop();
        }
        // Safety: READY
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

// Safety: shared after READY; initialization is single-writer.
unsafe impl<T: Sync + Send> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}
