// SPDX-License-Identifier: Apache-2.0

//! The complete measurement: polarize the sample, play the excitation pulse, then capture and
//! stream the response.
//!
//! Relay switching and settling happen here, in normal priority, between trigger sequences; the
//! sequences themselves are run by the [`Engine`].

use core::fmt;

use embedded_hal::{
    delay::DelayNs,
    digital::{Error as _, ErrorKind, OutputPin},
};

use crate::{
    command::{CommandError, NmrCommand, USAGE_ERROR},
    components::Trigger,
    engine::{Engine, SequenceError},
    stream::{write_line, SampleFrame, Transport},
    timing::{Mode, SequenceParameters, TimingConfig},
};

/// Sent at startup and after every command
pub const READY_MESSAGE: &str = "NMR Controller Ready. Waiting for commands...";

/// Fixed parameters of a measurement
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ExperimentPlan {
    /// Time the polarization coil stays energized
    pub polarize_ms: u32,
    /// Time allowed for a relay to switch mechanically
    pub relay_settle_ms: u32,
    /// Frequency of the excitation sine (the Larmor frequency of the sample)
    pub excitation_hz: u32,
    /// ADC sample rate during acquisition
    pub acquisition_hz: u32,
    /// Pause between ring buffer drains while acquiring, in microseconds
    pub stream_poll_us: u32,
    /// Extra time allowed on top of a sequence's duration before it is considered stuck
    pub completion_margin_ms: u32,
}

impl Default for ExperimentPlan {
    fn default() -> Self {
        Self {
            polarize_ms: 5_000,
            relay_settle_ms: 10,
            excitation_hz: 1701,
            acquisition_hz: 10_000,
            stream_poll_us: 100,
            completion_margin_ms: 100,
        }
    }
}

impl ExperimentPlan {
    /// Time to wait for a sequence of `duration_ms` before giving up, in microseconds
    fn timeout_us(&self, duration_ms: u32) -> u64 {
        (u64::from(duration_ms) + u64::from(self.completion_margin_ms)) * 1000
    }
}

/// Measurement failure. The relays are returned to their idle state before this is reported.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ExperimentError<TE, XE> {
    /// A trigger sequence could not be started
    Sequence(SequenceError<TE>),
    /// A trigger sequence did not finish in time and was aborted
    Timeout(Mode),
    /// A relay pin could not be driven
    Relay(ErrorKind),
    /// The host connection failed
    Transport(XE),
}

impl<TE, XE> From<SequenceError<TE>> for ExperimentError<TE, XE> {
    fn from(err: SequenceError<TE>) -> Self {
        ExperimentError::Sequence(err)
    }
}

impl<TE, XE> From<ErrorKind> for ExperimentError<TE, XE> {
    fn from(kind: ErrorKind) -> Self {
        ExperimentError::Relay(kind)
    }
}

impl<TE: fmt::Debug, XE: fmt::Debug> fmt::Display for ExperimentError<TE, XE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExperimentError::Sequence(err) => write!(f, "{err}"),
            ExperimentError::Timeout(mode) => write!(f, "{mode:?} sequence did not complete"),
            ExperimentError::Relay(kind) => write!(f, "relay fault: {kind}"),
            ExperimentError::Transport(err) => write!(f, "host transport failed: {err:?}"),
        }
    }
}

/// Outcome of a successful measurement
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RunReport {
    /// Timing used for the excitation pulse
    pub excitation: SequenceParameters,
    /// Timing used for the acquisition
    pub acquisition: SequenceParameters,
    /// Samples streamed to the host
    pub samples: u32,
    /// Samples lost because the stream fell behind
    pub overruns: u32,
}

/// Hardware used outside the tick interrupt
pub struct Rig<P, W, T, D> {
    /// Energizes the polarization coil when high
    pub polarization: P,
    /// Connects the coil to the DAC when high, to the ADC when low
    pub read_write: W,
    /// Trigger shared with the tick interrupt, used to arm sequences
    pub trigger: T,
    /// Delay provider for relay timing and completion polling
    pub delay: D,
}

/// Runs measurements on a [`Rig`]
pub struct Experiment<P, W, T, D> {
    /// Hardware
    rig: Rig<P, W, T, D>,
    /// Measurement constants
    plan: ExperimentPlan,
    /// Trigger clock
    timing: TimingConfig,
}

impl<P, W, T, D> Experiment<P, W, T, D>
where
    P: OutputPin,
    W: OutputPin,
    T: Trigger,
    D: DelayNs,
{
    /// Wrap a rig. The relays are not touched until the first run.
    pub fn new(rig: Rig<P, W, T, D>, plan: ExperimentPlan, timing: TimingConfig) -> Self {
        Self { rig, plan, timing }
    }

    /// Measurement constants in use
    pub fn plan(&self) -> &ExperimentPlan {
        &self.plan
    }

    /// Release the hardware
    pub fn free(self) -> Rig<P, W, T, D> {
        self.rig
    }

    /// Answer one line received from the host.
    ///
    /// A valid command runs the measurement and is always followed by [`READY_MESSAGE`], even
    /// when the run fails. A malformed line only gets the usage error.
    pub fn respond<H: Transport, const N: usize>(
        &mut self,
        engine: &Engine<N>,
        line: Result<NmrCommand, CommandError>,
        host: &mut H,
    ) -> Result<Option<RunReport>, H::Error> {
        let command = match line {
            Ok(command) => command,
            Err(err) => {
                warn!("Rejected host command: {:?}", err);
                write_line(host, format_args!("{}", USAGE_ERROR))?;
                return Ok(None);
            }
        };

        write_line(
            host,
            format_args!(
                "COMMAND RECEIVED: Pulse={}ms, Read={}ms",
                command.pulse_ms, command.read_ms
            ),
        )?;
        let report = match self.run(engine, command, host) {
            Ok(report) => Some(report),
            Err(ExperimentError::Transport(err)) => return Err(err),
            Err(err) => {
                write_line(host, format_args!("ERROR: {}", err))?;
                None
            }
        };
        write_line(host, format_args!("{}", READY_MESSAGE))?;
        Ok(report)
    }

    /// Run one full measurement, blocking until the last sample has been streamed.
    ///
    /// On failure the engine is stopped and both relays are released before returning.
    pub fn run<H: Transport, const N: usize>(
        &mut self,
        engine: &Engine<N>,
        command: NmrCommand,
        host: &mut H,
    ) -> Result<RunReport, ExperimentError<T::Error, H::Error>> {
        info!(
            "Measurement start: {} ms pulse, {} ms read",
            command.pulse_ms, command.read_ms
        );
        let result = self.run_phases(engine, command, host);
        match &result {
            Ok(report) => info!(
                "Measurement done: {} samples, {} lost",
                report.samples, report.overruns
            ),
            Err(_) => {
                engine.abort();
                // Best effort, the original failure is what gets reported
                let _ = self.rig.polarization.set_low();
                let _ = self.rig.read_write.set_low();
                error!("Measurement failed, relays released");
            }
        }
        result
    }

    /// Polarization, excitation and acquisition in order
    fn run_phases<H: Transport, const N: usize>(
        &mut self,
        engine: &Engine<N>,
        command: NmrCommand,
        host: &mut H,
    ) -> Result<RunReport, ExperimentError<T::Error, H::Error>> {
        let plan = self.plan;

        status(
            host,
            format_args!("Polarizing coil ON for {} ms...", plan.polarize_ms),
        )?;
        self.rig.polarization.set_high().map_err(|err| err.kind())?;
        self.rig.delay.delay_ms(plan.polarize_ms);
        self.rig.polarization.set_low().map_err(|err| err.kind())?;
        status(host, format_args!("Polarization complete."))?;

        status(host, format_args!("Setting relay to WRITE mode..."))?;
        self.rig.read_write.set_high().map_err(|err| err.kind())?;
        self.rig.delay.delay_ms(plan.relay_settle_ms);

        status(host, format_args!("Starting excitation pulse..."))?;
        debug!("Phase: excitation");
        let excitation = engine.begin_excitation(
            plan.excitation_hz,
            command.pulse_ms,
            &self.timing,
            &mut self.rig.trigger,
        )?;
        engine
            .wait_complete(&mut self.rig.delay, Some(plan.timeout_us(command.pulse_ms)))
            .map_err(|_| ExperimentError::Timeout(Mode::Excitation))?;
        status(host, format_args!("Pulse finished."))?;

        status(host, format_args!("Setting relay to READ mode..."))?;
        self.rig.read_write.set_low().map_err(|err| err.kind())?;
        self.rig.delay.delay_ms(plan.relay_settle_ms);

        status(
            host,
            format_args!("Starting data read at {} SPS...", plan.acquisition_hz),
        )?;
        debug!("Phase: acquisition");
        let acquisition = engine.begin_acquisition(
            plan.acquisition_hz,
            command.read_ms,
            &self.timing,
            &mut self.rig.trigger,
        )?;
        let samples = self.stream(engine, plan.timeout_us(command.read_ms), host)?;
        let overruns = engine.overruns();
        if overruns > 0 {
            warn!("Stream fell behind, {} samples overwritten", overruns);
        }
        status(host, format_args!("Data read complete. Sequence finished."))?;

        Ok(RunReport {
            excitation,
            acquisition,
            samples,
            overruns,
        })
    }

    /// Forward samples to the host as they arrive, until the acquisition completes
    fn stream<H: Transport, const N: usize>(
        &mut self,
        engine: &Engine<N>,
        timeout_us: u64,
        host: &mut H,
    ) -> Result<u32, ExperimentError<T::Error, H::Error>> {
        let poll_us = self.plan.stream_poll_us.max(1);
        let mut frame = SampleFrame::open(host).map_err(ExperimentError::Transport)?;
        let mut waited_us = 0u64;
        let mut timed_out = false;
        while !engine.is_complete() {
            frame
                .push_all(engine.drain_available_samples())
                .map_err(ExperimentError::Transport)?;
            if waited_us >= timeout_us {
                engine.abort();
                timed_out = true;
                break;
            }
            self.rig.delay.delay_us(poll_us);
            waited_us = waited_us.saturating_add(u64::from(poll_us));
        }
        // Samples captured after the last drain
        frame
            .push_all(engine.drain_available_samples())
            .map_err(ExperimentError::Transport)?;
        let samples = frame.close().map_err(ExperimentError::Transport)?;
        if timed_out {
            warn!("Acquisition stalled after {} samples", samples);
            return Err(ExperimentError::Timeout(Mode::Acquisition));
        }
        Ok(samples)
    }
}

/// Send a `STATUS:` line
fn status<H: Transport, TE>(
    host: &mut H,
    args: fmt::Arguments<'_>,
) -> Result<(), ExperimentError<TE, H::Error>> {
    write_line(host, format_args!("STATUS: {}", args)).map_err(ExperimentError::Transport)
}
