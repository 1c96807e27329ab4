//! Byte stream to the host: framed binary sample blocks and text status lines share one
//! transport.
//!
//! A sample block starts and ends with [`FRAME_SENTINEL`], with every sample in between as a
//! little-endian `u16`. Samples are 12-bit ADC codes, so the sentinel never appears as data.

use core::fmt::{self, Debug, Write};

use crate::buffer::Sample;

/// Marker written before the first and after the last sample of an acquisition
pub const FRAME_SENTINEL: u16 = 0xFFFF;

/// Bytes collected before handing samples to the transport
const CHUNK_BYTES: usize = 64;

/// Blocking byte sink towards the host
pub trait Transport {
    /// Transport failure
    type Error: Debug;

    /// Send every byte of `bytes`, in order.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    type Error = T::Error;

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        T::write_all(self, bytes)
    }
}

/// A write through [`write_all_within`] failed
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriteError<E> {
    /// The port accepted nothing for longer than the stall limit; the rest was dropped
    Stalled {
        /// Bytes still unsent
        remaining: usize,
    },
    /// The port failed
    Port(E),
}

/// Push `bytes` through a non-blocking port.
///
/// `try_write` returns how many leading bytes the port took, or `None` while it has no room.
/// Once `stall_limit_us` passes on the `now_us` clock without any progress, the write is
/// abandoned, so a host which stops reading cannot wedge the caller.
pub fn write_all_within<E>(
    mut bytes: &[u8],
    stall_limit_us: u64,
    mut now_us: impl FnMut() -> u64,
    mut try_write: impl FnMut(&[u8]) -> Result<Option<usize>, E>,
) -> Result<(), WriteError<E>> {
    let mut last_progress = now_us();
    while !bytes.is_empty() {
        match try_write(bytes).map_err(WriteError::Port)? {
            Some(count) if count > 0 => {
                bytes = &bytes[count.min(bytes.len())..];
                last_progress = now_us();
            }
            _ => {
                if now_us().wrapping_sub(last_progress) >= stall_limit_us {
                    warn!("Host stopped reading, dropping {} bytes", bytes.len());
                    return Err(WriteError::Stalled {
                        remaining: bytes.len(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Send one line of text, terminated with `\n`.
pub fn write_line<T: Transport>(
    transport: &mut T,
    args: fmt::Arguments<'_>,
) -> Result<(), T::Error> {
    /// Forwards formatted text, keeping the transport error
    struct Adapter<'a, T: Transport> {
        /// Destination
        transport: &'a mut T,
        /// First transport failure
        error: Option<T::Error>,
    }

    impl<T: Transport> Write for Adapter<'_, T> {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            self.transport.write_all(s.as_bytes()).map_err(|err| {
                self.error = Some(err);
                fmt::Error
            })
        }
    }

    let mut adapter = Adapter {
        transport,
        error: None,
    };
    // A formatting failure without a transport error leaves nothing to report
    let _ = adapter
        .write_fmt(args)
        .and_then(|()| adapter.write_str("\n"));
    match adapter.error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// An open sample block. Created with [`SampleFrame::open`], finished with
/// [`SampleFrame::close`].
pub struct SampleFrame<'a, T: Transport> {
    /// Destination
    transport: &'a mut T,
    /// Samples written so far
    samples: u32,
}

impl<'a, T: Transport> SampleFrame<'a, T> {
    /// Write the opening sentinel.
    pub fn open(transport: &'a mut T) -> Result<Self, T::Error> {
        transport.write_all(&FRAME_SENTINEL.to_le_bytes())?;
        Ok(Self {
            transport,
            samples: 0,
        })
    }

    /// Write samples in order, batching them into larger transport writes.
    pub fn push_all<I>(&mut self, samples: I) -> Result<(), T::Error>
    where
        I: IntoIterator<Item = Sample>,
    {
        let mut chunk = [0u8; CHUNK_BYTES];
        let mut filled = 0;
        for sample in samples {
            chunk[filled..filled + 2].copy_from_slice(&sample.to_le_bytes());
            filled += 2;
            self.samples = self.samples.wrapping_add(1);
            if filled == CHUNK_BYTES {
                self.transport.write_all(&chunk)?;
                filled = 0;
            }
        }
        if filled > 0 {
            self.transport.write_all(&chunk[..filled])?;
        }
        Ok(())
    }

    /// Samples written so far
    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Write the closing sentinel and return the number of samples in the block.
    pub fn close(self) -> Result<u32, T::Error> {
        self.transport.write_all(&FRAME_SENTINEL.to_le_bytes())?;
        Ok(self.samples)
    }
}
