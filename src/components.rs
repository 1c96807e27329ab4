//! Hardware the engine drives on every tick.
//!
//! The engine only needs three capabilities: a re-armable trigger, a masked parallel output for
//! the DAC, and a one-shot sample source for the ADC. RP2040 implementations live in
//! [`rp2040`](crate::rp2040) when the `rp2040` feature is enabled.

use core::fmt::Debug;

use crate::buffer::Sample;

/// Clock-driven pulse source which fires the tick interrupt once per armed delay.
pub trait Trigger {
    /// Error raised when the trigger cannot accept a new delay
    type Error: Debug;

    /// Queue a delay of `cycles` clock cycles; the trigger fires once it elapses.
    fn arm(&mut self, cycles: u32) -> Result<(), Self::Error>;

    /// Clear the pending tick interrupt.
    fn acknowledge(&mut self);
}

/// Parallel output lines feeding the DAC
pub trait WaveformOutput {
    /// Drive the lines in `mask` to the matching bits of `pattern`, leaving other lines alone.
    fn write_masked(&mut self, mask: u32, pattern: u32);
}

/// Single-sample ADC read
pub trait SampleSource {
    /// Convert and return one sample.
    fn read_sample(&mut self) -> Sample;
}
