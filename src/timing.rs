//! Conversion of a requested frequency and duration into trigger timing.

use core::fmt;

use crate::waveform::TICKS_PER_PERIOD;

/// What the engine does on every tick
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    /// Write the next waveform point to the DAC
    Excitation,
    /// Capture one ADC sample into the ring buffer
    Acquisition,
}

impl Mode {
    /// Ticks needed for one period of the requested frequency.
    ///
    /// An excitation period is drawn from [`TICKS_PER_PERIOD`] points, while an acquisition
    /// frequency is already a sample rate.
    pub const fn ticks_per_period(self) -> u64 {
        match self {
            Mode::Excitation => TICKS_PER_PERIOD as u64,
            Mode::Acquisition => 1,
        }
    }
}

/// Clock properties of the trigger hardware
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimingConfig {
    /// Clock driving the trigger, in Hz
    pub system_clock_hz: u32,
    /// Clock cycles spent by the trigger between being re-armed and firing, on top of the
    /// requested delay. Empirical and specific to the trigger implementation.
    pub overhead_cycles: u32,
}

/// Invalid frequency/duration request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// A frequency of 0 Hz was requested
    ZeroFrequency,
    /// The tick interval is not longer than the trigger's own overhead
    IntervalTooShort {
        /// Clock cycles per tick before the overhead correction
        cycles: u32,
        /// Overhead correction of the trigger
        overhead: u32,
    },
    /// The sequence has more ticks than can be counted
    TooManyTicks {
        /// Requested number of ticks
        ticks: u64,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroFrequency => f.write_str("frequency must be above 0 Hz"),
            ConfigError::IntervalTooShort { cycles, overhead } => write!(
                f,
                "tick interval of {cycles} cycles does not exceed the trigger overhead of {overhead} cycles"
            ),
            ConfigError::TooManyTicks { ticks } => {
                write!(f, "sequence of {ticks} ticks exceeds the tick counter")
            }
        }
    }
}

/// Timing of one trigger sequence
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SequenceParameters {
    /// Delay loaded into the trigger for every tick, in clock cycles
    pub cycles_per_tick: u32,
    /// Number of ticks in the sequence
    pub total_ticks: u32,
}

impl SequenceParameters {
    /// Derive the tick interval and length of a sequence.
    ///
    /// `cycles_per_tick` is the clock/tick ratio rounded to the nearest cycle, minus
    /// [`TimingConfig::overhead_cycles`]. `total_ticks` truncates: a partial tick at the end of
    /// `duration_ms` is not emitted.
    ///
    /// ```
    /// use nmr_pulse_engine::timing::{Mode, SequenceParameters, TimingConfig};
    ///
    /// let timing = TimingConfig { system_clock_hz: 125_000_000, overhead_cycles: 5 };
    /// let params = SequenceParameters::derive(Mode::Acquisition, 10_000, 100, &timing).unwrap();
    /// assert_eq!(params.cycles_per_tick, 12_495);
    /// assert_eq!(params.total_ticks, 1_000);
    /// ```
    pub fn derive(
        mode: Mode,
        frequency_hz: u32,
        duration_ms: u32,
        timing: &TimingConfig,
    ) -> Result<Self, ConfigError> {
        if frequency_hz == 0 {
            return Err(ConfigError::ZeroFrequency);
        }
        let tick_hz = frequency_hz as u64 * mode.ticks_per_period();

        let clock_hz = timing.system_clock_hz as u64;
        // Never above the clock rate, so it fits
        let cycles = ((clock_hz + tick_hz / 2) / tick_hz) as u32;
        if cycles <= timing.overhead_cycles {
            return Err(ConfigError::IntervalTooShort {
                cycles,
                overhead: timing.overhead_cycles,
            });
        }

        let ticks = (duration_ms as u64)
            .checked_mul(tick_hz)
            .map_or(u64::MAX, |tick_ms| tick_ms / 1000);
        let total_ticks =
            u32::try_from(ticks).map_err(|_| ConfigError::TooManyTicks { ticks })?;

        Ok(Self {
            cycles_per_tick: cycles - timing.overhead_cycles,
            total_ticks,
        })
    }

    /// Effective tick period in nanoseconds, overhead included. `None` for a 0 Hz clock.
    pub fn tick_period_ns(&self, timing: &TimingConfig) -> Option<u64> {
        (self.cycles_per_tick as u64 + timing.overhead_cycles as u64)
            .saturating_mul(1_000_000_000)
            .checked_div(timing.system_clock_hz as u64)
    }
}
