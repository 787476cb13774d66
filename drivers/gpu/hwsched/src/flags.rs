//! Atomic storage for `bitflags` types.

use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::Flags;

/// A flag word that can be tested and updated without a lock
pub(crate) struct AtomicBits<F> {
    bits: AtomicU32,
    _flags: PhantomData<F>,
}

impl<F: Flags<Bits = u32> + Copy> AtomicBits<F> {
    /// Empty flag word
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
            _flags: PhantomData,
        }
    }

    /// Current flags
    pub fn get(&self) -> F {
        F::from_bits_retain(self.bits.load(Ordering::Acquire))
    }

    /// Whether every flag in `flags` is set
    pub fn contains(&self, flags: F) -> bool {
        self.get().contains(flags)
    }

    /// Set `flags`, returning the previous word
    pub fn insert(&self, flags: F) -> F {
        F::from_bits_retain(self.bits.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Clear `flags`, returning the previous word
    pub fn remove(&self, flags: F) -> F {
        F::from_bits_retain(self.bits.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    /// Set `flags` and report whether they were all already set
    pub fn test_and_set(&self, flags: F) -> bool {
        self.insert(flags).contains(flags)
    }

    /// Clear `flags` and report whether they were all set
    pub fn test_and_clear(&self, flags: F) -> bool {
        self.remove(flags).contains(flags)
    }
}

impl<F: Flags<Bits = u32> + Copy + fmt::Debug> fmt::Debug for AtomicBits<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.get(), f)
    }
}
