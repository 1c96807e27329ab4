// SPDX-License-Identifier: Apache-2.0

//! Lock-free ring buffer carrying ADC samples from the tick handler to the streaming loop.

use core::sync::atomic::{fence, AtomicU16, AtomicU32, Ordering};

/// Number of samples held by the acquisition ring buffer
pub const RING_BUFFER_SIZE: usize = 256;

/// A raw ADC sample (12 significant bits)
pub type Sample = u16;

/// Zeroed slot, used to build the storage array
#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: AtomicU16 = AtomicU16::new(0);

/// Free-running position in the sample stream.
///
/// Positions are never wrapped to the buffer size, so the number of pending samples is always
/// `write - read` (modulo 2<sup>32</sup>). A slot index is obtained with [`Position::slot`].
#[derive(Default, Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Position(u32);

impl Position {
    /// Get current position value
    pub fn get(&self) -> u32 {
        self.0
    }

    /// The following position, wrapping at [`u32::MAX`]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Number of samples from `earlier` up to (not including) `self`
    pub fn distance_from(self, earlier: Position) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// Position `count` samples before this one
    pub fn rewind(self, count: u32) -> Self {
        Self(self.0.wrapping_sub(count))
    }

    /// Slot index within a buffer of `N` entries. `N` must be a power of two, so the mapping
    /// stays continuous when the position wraps.
    pub fn slot<const N: usize>(self) -> usize {
        self.0 as usize & (N - 1)
    }
}

/// Fixed-capacity single-producer/single-consumer ring of [`Sample`]s with overwrite-oldest
/// semantics.
///
/// The producer is the tick handler, the consumer is the main loop. The producer only stores
/// `write`, the consumer only stores `read` and `overruns`, so no read-modify-write atomics are
/// needed (ARMv6-M has none). The producer never waits for the consumer: once it is more than
/// `N` samples ahead, the oldest unread samples are lost and counted as overruns when the
/// consumer catches up.
///
/// Each push must run to completion before the consumer can observe it, which holds when the
/// producer runs in interrupt context and the consumer does not.
pub struct RingBuffer<const N: usize> {
    /// Sample storage
    slots: [AtomicU16; N],
    /// Position of the next sample to be written
    write: AtomicU32,
    /// Position of the next sample to be read
    read: AtomicU32,
    /// Samples lost to overwriting since the last reset
    overruns: AtomicU32,
}

impl<const N: usize> RingBuffer<N> {
    /// Create an empty buffer.
    ///
    /// Panics (at compile time, for a `static`) if `N` is not a power of two.
    pub const fn new() -> Self {
        assert!(
            N.is_power_of_two() && N <= 1 << 31,
            "ring buffer capacity must be a power of two"
        );
        Self {
            slots: [EMPTY_SLOT; N],
            write: AtomicU32::new(0),
            read: AtomicU32::new(0),
            overruns: AtomicU32::new(0),
        }
    }

    /// Number of samples the buffer holds before overwriting
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Store a sample at the write position. Producer side only.
    #[inline(always)]
    pub fn push(&self, sample: Sample) {
        let write = Position(self.write.load(Ordering::Relaxed));
        self.slots[write.slot::<N>()].store(sample, Ordering::Relaxed);
        self.write.store(write.next().get(), Ordering::Release);
    }

    /// `true` if no unread samples remain. Consumer side only.
    pub fn is_empty(&self) -> bool {
        self.write.load(Ordering::Acquire) == self.read.load(Ordering::Relaxed)
    }

    /// Take the oldest unread sample. Consumer side only.
    ///
    /// If the producer has lapped the consumer, the read position first skips to the newest `N`
    /// samples and the skipped samples are added to [`overruns`](Self::overruns).
    pub fn pop(&self) -> Option<Sample> {
        let mut read = Position(self.read.load(Ordering::Relaxed));
        loop {
            let write = Position(self.write.load(Ordering::Acquire));
            if write == read {
                return None;
            }

            let pending = write.distance_from(read);
            if pending > N as u32 {
                self.record_overruns(pending - N as u32);
                read = write.rewind(N as u32);
            }

            let sample = self.slots[read.slot::<N>()].load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            // The slot is reused by the push at `read + N`
            if Position(self.write.load(Ordering::Relaxed)).distance_from(read) > N as u32 {
                self.record_overruns(1);
                read = read.next();
                continue;
            }

            self.read.store(read.next().get(), Ordering::Release);
            return Some(sample);
        }
    }

    /// Iterator taking every sample available right now. Consumer side only.
    pub fn drain(&self) -> Drain<'_, N> {
        Drain { buffer: self }
    }

    /// Samples lost to overwriting since the last [`reset`](Self::reset)
    pub fn overruns(&self) -> u32 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Discard unread samples and clear the overrun counter. Consumer side only, and only while
    /// the producer is idle.
    pub fn reset(&self) {
        self.read
            .store(self.write.load(Ordering::Acquire), Ordering::Release);
        self.overruns.store(0, Ordering::Relaxed);
    }

    /// Consumer-side overrun accounting
    fn record_overruns(&self, lost: u32) {
        let total = self.overruns.load(Ordering::Relaxed).saturating_add(lost);
        self.overruns.store(total, Ordering::Relaxed);
        debug!("Reader overrun: {} samples lost, {} in total", lost, total);
    }

    /// Buffer whose positions start at `start`, to exercise position wrap-around.
    #[cfg(test)]
    fn starting_at(start: u32) -> Self {
        let buffer = Self::new();
        buffer.write.store(start, Ordering::Relaxed);
        buffer.read.store(start, Ordering::Relaxed);
        buffer
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Draining iterator returned by [`RingBuffer::drain`]. Ends as soon as the buffer is empty, and
/// may be resumed later.
pub struct Drain<'a, const N: usize> {
    /// Buffer being drained
    buffer: &'a RingBuffer<N>,
}

impl<const N: usize> Iterator for Drain<'_, N> {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        self.buffer.pop()
    }
}
