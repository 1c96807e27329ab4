// SPDX-License-Identifier: Apache-2.0

//! Real-time trigger engine: arms excitation and acquisition sequences and services their ticks.
//!
//! All state shared with the tick interrupt is held in atomics inside [`Engine`], which is meant
//! to live in a `static` (see [`ENGINE`](crate::interrupt::ENGINE)). Each field has a single
//! writer at any time: the sequence controller writes the timing fields only while no sequence
//! is running, and the tick handler owns the tick counter and completion flag while one is.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use embedded_hal::delay::DelayNs;

use crate::{
    buffer::{Drain, RingBuffer},
    components::{SampleSource, Trigger, WaveformOutput},
    timing::{ConfigError, Mode, SequenceParameters, TimingConfig},
    waveform::WaveformTable,
};

/// Polling interval of [`Engine::wait_complete`], in microseconds
const WAIT_POLL_US: u32 = 10;

/// A sequence could not be started
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SequenceError<E> {
    /// Another sequence is still running
    Busy,
    /// The requested frequency/duration cannot be produced
    Config(ConfigError),
    /// The trigger refused the first delay
    Trigger(E),
}

impl<E> From<ConfigError> for SequenceError<E> {
    fn from(err: ConfigError) -> Self {
        SequenceError::Config(err)
    }
}

impl<E: fmt::Debug> fmt::Display for SequenceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceError::Busy => f.write_str("a sequence is already running"),
            SequenceError::Config(err) => write!(f, "invalid sequence timing: {err}"),
            SequenceError::Trigger(err) => write!(f, "unable to arm trigger: {err:?}"),
        }
    }
}

/// The sequence did not finish within the allotted time
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WaitTimeout;

impl fmt::Display for WaitTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("timed out waiting for sequence completion")
    }
}

/// Raw value of [`Mode::Excitation`] in [`Engine::mode`]
const MODE_EXCITATION: u8 = 0;
/// Raw value of [`Mode::Acquisition`] in [`Engine::mode`]
const MODE_ACQUISITION: u8 = 1;

/// Excitation/acquisition engine with an `N`-sample acquisition ring buffer.
pub struct Engine<const N: usize> {
    /// DAC patterns for the excitation waveform
    table: WaveformTable,
    /// Samples captured during acquisition, waiting to be streamed
    ring: RingBuffer<N>,
    /// Trigger delay of the current sequence
    cycles_per_tick: AtomicU32,
    /// Length of the current sequence
    total_ticks: AtomicU32,
    /// Ticks serviced so far in the current sequence
    tick_count: AtomicU32,
    /// [`Mode`] of the current sequence
    mode: AtomicU8,
    /// No sequence is running
    completed: AtomicBool,
}

impl<const N: usize> Engine<N> {
    /// Idle engine, usable in a `static`
    pub const fn new() -> Self {
        Self {
            table: WaveformTable::new(),
            ring: RingBuffer::new(),
            cycles_per_tick: AtomicU32::new(0),
            total_ticks: AtomicU32::new(0),
            tick_count: AtomicU32::new(0),
            mode: AtomicU8::new(MODE_EXCITATION),
            completed: AtomicBool::new(true),
        }
    }

    /// Start emitting the sine waveform at `frequency_hz` for `duration_ms`.
    ///
    /// Every waveform period is 16 ticks, so the trigger runs at 16 × `frequency_hz`.
    pub fn begin_excitation<T: Trigger>(
        &self,
        frequency_hz: u32,
        duration_ms: u32,
        timing: &TimingConfig,
        trigger: &mut T,
    ) -> Result<SequenceParameters, SequenceError<T::Error>> {
        self.begin(Mode::Excitation, frequency_hz, duration_ms, timing, trigger)
    }

    /// Start capturing `frequency_hz` samples per second for `duration_ms`. Unread samples from
    /// the previous acquisition are discarded.
    pub fn begin_acquisition<T: Trigger>(
        &self,
        frequency_hz: u32,
        duration_ms: u32,
        timing: &TimingConfig,
        trigger: &mut T,
    ) -> Result<SequenceParameters, SequenceError<T::Error>> {
        self.begin(Mode::Acquisition, frequency_hz, duration_ms, timing, trigger)
    }

    /// Validate, reset state and arm the first tick.
    ///
    /// Nothing is modified when a sequence is already running or the timing is invalid. A
    /// sequence of zero ticks completes immediately without arming the trigger.
    fn begin<T: Trigger>(
        &self,
        mode: Mode,
        frequency_hz: u32,
        duration_ms: u32,
        timing: &TimingConfig,
        trigger: &mut T,
    ) -> Result<SequenceParameters, SequenceError<T::Error>> {
        if !self.is_complete() {
            warn!("Ignoring {:?} request: a sequence is still running", mode);
            return Err(SequenceError::Busy);
        }

        let params = SequenceParameters::derive(mode, frequency_hz, duration_ms, timing)
            .inspect_err(|err| {
                warn!(
                    "Rejected {:?} at {} Hz for {} ms: {:?}",
                    mode, frequency_hz, duration_ms, err
                )
            })?;

        self.cycles_per_tick
            .store(params.cycles_per_tick, Ordering::Relaxed);
        self.total_ticks.store(params.total_ticks, Ordering::Relaxed);
        self.tick_count.store(0, Ordering::Relaxed);
        self.mode.store(
            match mode {
                Mode::Excitation => MODE_EXCITATION,
                Mode::Acquisition => MODE_ACQUISITION,
            },
            Ordering::Relaxed,
        );
        if mode == Mode::Acquisition {
            self.ring.reset();
        }

        if params.total_ticks == 0 {
            info!("{:?} of {} ms has no ticks, nothing to do", mode, duration_ms);
            return Ok(params);
        }

        self.completed.store(false, Ordering::Release);
        if let Err(err) = trigger.arm(params.cycles_per_tick) {
            self.completed.store(true, Ordering::Release);
            error!("Unable to arm trigger for {:?}", mode);
            return Err(SequenceError::Trigger(err));
        }

        debug!(
            "{:?} armed: {} ticks, {} cycles per tick",
            mode, params.total_ticks, params.cycles_per_tick
        );
        Ok(params)
    }

    /// Service one trigger tick. Call from the trigger's interrupt handler only.
    ///
    /// The next tick is armed first so the trigger keeps its cadence while the sample is
    /// handled. On the last tick the trigger is left idle and the sequence is marked complete.
    /// Ticks arriving while no sequence runs are acknowledged and otherwise ignored.
    #[inline]
    pub fn on_tick<T, O, S>(&self, trigger: &mut T, output: &mut O, source: &mut S)
    where
        T: Trigger,
        O: WaveformOutput,
        S: SampleSource,
    {
        if self.completed.load(Ordering::Acquire) {
            trigger.acknowledge();
            return;
        }

        let tick = self.tick_count.load(Ordering::Relaxed);
        let mut last_tick = tick.saturating_add(1) >= self.total_ticks.load(Ordering::Relaxed);
        if !last_tick
            && trigger
                .arm(self.cycles_per_tick.load(Ordering::Relaxed))
                .is_err()
        {
            error!("Trigger refused delay after tick {}, ending sequence", tick);
            last_tick = true;
        }

        match self.mode() {
            Mode::Acquisition => self.ring.push(source.read_sample()),
            Mode::Excitation => {
                output.write_masked(self.table.mask(), self.table.pattern_for_tick(tick))
            }
        }
        self.tick_count.store(tick.wrapping_add(1), Ordering::Relaxed);
        trigger.acknowledge();

        #[cfg(feature = "trace_ticks")]
        trace!("tick {} serviced, last: {}", tick, last_tick);

        if last_tick {
            self.completed.store(true, Ordering::Release);
        }
    }

    /// `true` when no sequence is running
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Block until the running sequence completes, polling every few microseconds.
    ///
    /// With `timeout_us` set, gives up once that much time has been spent waiting. Samples are
    /// not drained while waiting, so long acquisitions should stream with
    /// [`drain_available_samples`](Self::drain_available_samples) instead.
    pub fn wait_complete<D: DelayNs>(
        &self,
        delay: &mut D,
        timeout_us: Option<u64>,
    ) -> Result<(), WaitTimeout> {
        let mut waited_us = 0u64;
        while !self.is_complete() {
            if timeout_us.is_some_and(|limit| waited_us >= limit) {
                warn!(
                    "{:?} still running after {} us ({} of {} ticks)",
                    self.mode(),
                    waited_us,
                    self.tick_count(),
                    self.total_ticks.load(Ordering::Relaxed)
                );
                return Err(WaitTimeout);
            }
            delay.delay_us(WAIT_POLL_US);
            waited_us = waited_us.saturating_add(u64::from(WAIT_POLL_US));
        }
        Ok(())
    }

    /// Stop the running sequence after the tick currently in flight.
    ///
    /// The trigger may still fire once for a delay armed before the abort; that tick is
    /// ignored, but a new sequence should not be started until it has passed.
    pub fn abort(&self) {
        if !self.is_complete() {
            info!(
                "Aborting {:?} after {} ticks",
                self.mode(),
                self.tick_count()
            );
            self.completed.store(true, Ordering::Release);
        }
    }

    /// Take every captured sample that is ready. Never blocks.
    pub fn drain_available_samples(&self) -> Drain<'_, N> {
        self.ring.drain()
    }

    /// Samples lost since the current acquisition began because they were not drained in time
    pub fn overruns(&self) -> u32 {
        self.ring.overruns()
    }

    /// Mode of the running (or last) sequence
    pub fn mode(&self) -> Mode {
        match self.mode.load(Ordering::Relaxed) {
            MODE_ACQUISITION => Mode::Acquisition,
            _ => Mode::Excitation,
        }
    }

    /// Ticks serviced in the running (or last) sequence
    pub fn tick_count(&self) -> u32 {
        self.tick_count.load(Ordering::Relaxed)
    }

    /// Timing of the running (or last) sequence
    pub fn parameters(&self) -> SequenceParameters {
        SequenceParameters {
            cycles_per_tick: self.cycles_per_tick.load(Ordering::Relaxed),
            total_ticks: self.total_ticks.load(Ordering::Relaxed),
        }
    }
}

impl<const N: usize> Default for Engine<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{buffer::Sample, waveform::SINE_16};

    const PICO: TimingConfig = TimingConfig {
        system_clock_hz: 125_000_000,
        overhead_cycles: 5,
    };

    /// Trigger which records delays, and fires once per armed delay when polled
    #[derive(Default)]
    struct MockTrigger {
        armed: Vec<u32>,
        fired: usize,
        acknowledged: usize,
        refuse_after: Option<usize>,
    }

    impl MockTrigger {
        /// Consume one armed delay, if any
        fn fire(&mut self) -> bool {
            if self.fired < self.armed.len() {
                self.fired += 1;
                true
            } else {
                false
            }
        }
    }

    impl Trigger for MockTrigger {
        type Error = ();

        fn arm(&mut self, cycles: u32) -> Result<(), ()> {
            if self.refuse_after.is_some_and(|limit| self.armed.len() >= limit) {
                return Err(());
            }
            self.armed.push(cycles);
            Ok(())
        }

        fn acknowledge(&mut self) {
            self.acknowledged += 1;
        }
    }

    #[derive(Default)]
    struct MockDac {
        writes: Vec<(u32, u32)>,
    }

    impl WaveformOutput for MockDac {
        fn write_masked(&mut self, mask: u32, pattern: u32) {
            self.writes.push((mask, pattern));
        }
    }

    /// ADC returning a rising count
    #[derive(Default)]
    struct MockAdc {
        reads: u16,
    }

    impl SampleSource for MockAdc {
        fn read_sample(&mut self) -> Sample {
            self.reads += 1;
            self.reads - 1
        }
    }

    #[derive(Default)]
    struct Bench {
        trigger: MockTrigger,
        dac: MockDac,
        adc: MockAdc,
        samples: Vec<Sample>,
        ticks: usize,
    }

    impl Bench {
        /// Fire the trigger until it stops being re-armed, draining after every tick
        fn run(&mut self, engine: &Engine<256>) {
            while self.trigger.fire() {
                assert!(!engine.is_complete(), "tick fired after completion");
                engine.on_tick(&mut self.trigger, &mut self.dac, &mut self.adc);
                self.ticks += 1;
                self.samples.extend(engine.drain_available_samples());
            }
        }
    }

    #[test]
    fn acquisition_runs_exact_tick_count() {
        let engine = Engine::<256>::new();
        let mut bench = Bench::default();
        let params = engine
            .begin_acquisition(10_000, 100, &PICO, &mut bench.trigger)
            .unwrap();
        assert_eq!(params.cycles_per_tick, 12_495);
        assert_eq!(params.total_ticks, 1_000);
        assert!(!engine.is_complete());
        assert_eq!(engine.mode(), Mode::Acquisition);

        bench.run(&engine);
        assert!(engine.is_complete());
        assert_eq!(bench.ticks, 1_000);
        assert_eq!(engine.tick_count(), 1_000);
        assert_eq!(bench.trigger.acknowledged, 1_000);
        assert!(bench.trigger.armed.iter().all(|&cycles| cycles == 12_495));
        assert_eq!(bench.samples, (0..1_000).collect::<Vec<Sample>>());
        assert_eq!(engine.overruns(), 0);
    }

    #[test]
    fn acquisition_never_touches_dac() {
        let engine = Engine::<256>::new();
        let mut bench = Bench::default();
        engine
            .begin_acquisition(10_000, 10, &PICO, &mut bench.trigger)
            .unwrap();
        bench.run(&engine);
        assert!(bench.dac.writes.is_empty());
        assert_eq!(bench.adc.reads, 100);
    }

    #[test]
    fn excitation_plays_sine_without_sampling() {
        let engine = Engine::<256>::new();
        let mut bench = Bench::default();
        let params = engine
            .begin_excitation(1701, 50, &PICO, &mut bench.trigger)
            .unwrap();
        assert_eq!(params.total_ticks, 1360);

        bench.run(&engine);
        assert!(engine.is_complete());
        assert_eq!(bench.ticks, 1360);
        assert_eq!(bench.adc.reads, 0);
        assert!(bench.samples.is_empty());

        let table = WaveformTable::new();
        assert_eq!(bench.dac.writes.len(), 1360);
        for (tick, &(mask, pattern)) in bench.dac.writes.iter().enumerate() {
            assert_eq!(mask, table.mask());
            assert_eq!(table.decode(pattern), SINE_16[tick % 16]);
        }
    }

    #[test]
    fn single_tick_sequence() {
        let engine = Engine::<256>::new();
        let mut bench = Bench::default();
        // 1 ms at 1 kHz
        engine
            .begin_acquisition(1_000, 1, &PICO, &mut bench.trigger)
            .unwrap();
        bench.run(&engine);
        assert_eq!(bench.ticks, 1);
        assert_eq!(bench.trigger.armed.len(), 1);
        assert_eq!(bench.samples, [0]);
    }

    #[test]
    fn zero_ticks_complete_without_arming() {
        let engine = Engine::<256>::new();
        let mut bench = Bench::default();
        let params = engine
            .begin_excitation(1701, 0, &PICO, &mut bench.trigger)
            .unwrap();
        assert_eq!(params.total_ticks, 0);
        assert!(engine.is_complete());
        assert!(bench.trigger.armed.is_empty());
    }

    #[test]
    fn busy_request_changes_nothing() {
        let engine = Engine::<256>::new();
        let mut bench = Bench::default();
        let params = engine
            .begin_excitation(1701, 50, &PICO, &mut bench.trigger)
            .unwrap();
        for _ in 0..10 {
            assert!(bench.trigger.fire());
            engine.on_tick(&mut bench.trigger, &mut bench.dac, &mut bench.adc);
        }
        let armed = bench.trigger.armed.len();

        assert_eq!(
            engine.begin_acquisition(10_000, 100, &PICO, &mut bench.trigger),
            Err(SequenceError::Busy)
        );
        assert_eq!(
            engine.begin_excitation(1000, 10, &PICO, &mut bench.trigger),
            Err(SequenceError::Busy)
        );
        assert_eq!(engine.mode(), Mode::Excitation);
        assert_eq!(engine.tick_count(), 10);
        assert_eq!(engine.parameters(), params);
        assert_eq!(bench.trigger.armed.len(), armed);

        bench.run(&engine);
        assert_eq!(bench.dac.writes.len(), 1360);
    }

    #[test]
    fn invalid_timing_is_rejected_before_arming() {
        let engine = Engine::<256>::new();
        let mut bench = Bench::default();
        assert_eq!(
            engine.begin_acquisition(0, 100, &PICO, &mut bench.trigger),
            Err(SequenceError::Config(ConfigError::ZeroFrequency))
        );
        assert!(matches!(
            engine.begin_excitation(5_000_000, 100, &PICO, &mut bench.trigger),
            Err(SequenceError::Config(ConfigError::IntervalTooShort { .. }))
        ));
        assert!(engine.is_complete());
        assert!(bench.trigger.armed.is_empty());
        assert_eq!(engine.parameters().total_ticks, 0);
    }

    #[test]
    fn refused_first_delay_leaves_engine_idle() {
        let engine = Engine::<256>::new();
        let mut trigger = MockTrigger {
            refuse_after: Some(0),
            ..MockTrigger::default()
        };
        assert_eq!(
            engine.begin_acquisition(10_000, 100, &PICO, &mut trigger),
            Err(SequenceError::Trigger(()))
        );
        assert!(engine.is_complete());
    }

    #[test]
    fn refused_rearm_ends_sequence() {
        let engine = Engine::<256>::new();
        let mut bench = Bench {
            trigger: MockTrigger {
                refuse_after: Some(5),
                ..MockTrigger::default()
            },
            ..Bench::default()
        };
        engine
            .begin_acquisition(10_000, 100, &PICO, &mut bench.trigger)
            .unwrap();
        bench.run(&engine);
        assert!(engine.is_complete());
        // 5 armed delays, the fifth tick could not re-arm
        assert_eq!(bench.ticks, 5);
        assert_eq!(bench.samples, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn stray_tick_while_idle_is_acknowledged_only() {
        let engine = Engine::<256>::new();
        let mut bench = Bench::default();
        engine.on_tick(&mut bench.trigger, &mut bench.dac, &mut bench.adc);
        assert_eq!(bench.trigger.acknowledged, 1);
        assert!(bench.trigger.armed.is_empty());
        assert!(bench.dac.writes.is_empty());
        assert_eq!(bench.adc.reads, 0);
        assert_eq!(engine.tick_count(), 0);
    }

    #[test]
    fn abort_stops_rearming() {
        let engine = Engine::<256>::new();
        let mut bench = Bench::default();
        engine
            .begin_acquisition(10_000, 100, &PICO, &mut bench.trigger)
            .unwrap();
        for _ in 0..3 {
            assert!(bench.trigger.fire());
            engine.on_tick(&mut bench.trigger, &mut bench.dac, &mut bench.adc);
        }
        engine.abort();
        assert!(engine.is_complete());

        // The delay armed by the third tick still fires
        assert!(bench.trigger.fire());
        engine.on_tick(&mut bench.trigger, &mut bench.dac, &mut bench.adc);
        assert!(!bench.trigger.fire());
        assert_eq!(engine.tick_count(), 3);
        assert_eq!(engine.drain_available_samples().count(), 3);
    }

    #[test]
    fn slow_reader_loses_oldest_samples() {
        let engine = Engine::<256>::new();
        let mut bench = Bench::default();
        engine
            .begin_acquisition(10_000, 100, &PICO, &mut bench.trigger)
            .unwrap();
        while bench.trigger.fire() {
            engine.on_tick(&mut bench.trigger, &mut bench.dac, &mut bench.adc);
        }
        let samples: Vec<Sample> = engine.drain_available_samples().collect();
        assert_eq!(samples, (744..1_000).collect::<Vec<Sample>>());
        assert_eq!(engine.overruns(), 744);
    }

    /// Delay that services one tick per poll
    struct TickingDelay<'a> {
        engine: &'a Engine<256>,
        bench: &'a mut Bench,
        polls: usize,
    }

    impl DelayNs for TickingDelay<'_> {
        fn delay_ns(&mut self, _ns: u32) {
            self.polls += 1;
            if self.bench.trigger.fire() {
                self.engine.on_tick(
                    &mut self.bench.trigger,
                    &mut self.bench.dac,
                    &mut self.bench.adc,
                );
            }
        }
    }

    #[test]
    fn wait_returns_once_complete() {
        let engine = Engine::<256>::new();
        let mut bench = Bench::default();
        engine
            .begin_excitation(1701, 1, &PICO, &mut bench.trigger)
            .unwrap();
        let mut delay = TickingDelay {
            engine: &engine,
            bench: &mut bench,
            polls: 0,
        };
        assert_eq!(engine.wait_complete(&mut delay, None), Ok(()));
        // 1701 Hz * 16 * 1 ms = 27 ticks
        assert_eq!(delay.polls, 27);
        assert_eq!(engine.wait_complete(&mut delay, Some(0)), Ok(()));
    }

    #[test]
    fn wait_times_out() {
        let engine = Engine::<256>::new();
        let mut bench = Bench::default();
        engine
            .begin_acquisition(10_000, 100, &PICO, &mut bench.trigger)
            .unwrap();
        let mut delay = TickingDelay {
            engine: &engine,
            bench: &mut bench,
            polls: 0,
        };
        assert_eq!(engine.wait_complete(&mut delay, Some(50)), Err(WaitTimeout));
        assert_eq!(delay.polls, 5);
        assert!(!engine.is_complete());
    }
}
