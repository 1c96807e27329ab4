// SPDX-License-Identifier: Apache-2.0

//! RP2040 implementations of the engine's [`components`](crate::components).
//!
//! - [`PioTrigger`]: PIO0 state machine 0 counts down each delay pushed into its TX FIFO, then
//!   raises PIO IRQ 0.
//! - [`SioDac`]: masked writes to the SIO output register.
//! - [`OneShotAdc`]: blocking single conversion on the selected ADC channel.
//! - [`UsbTransport`]: USB CDC serial port shared with `USBCTRL_IRQ`.

use defmt::Format;
use rp2040_hal::{
    adc::Adc,
    gpio::{DynPinId, FunctionSioOutput, Pin, PullDown},
    pac,
    pio::{
        InstallError, PIOBuilder, Running, StateMachine, Tx, UninitStateMachine, PIO, SM0,
    },
    timer::Timer,
};
use usb_device::{device::UsbDeviceState, UsbError};

use crate::{
    buffer::Sample,
    components::{SampleSource, Trigger, WaveformOutput},
    engine::Engine,
    interrupt::{TICK_HARDWARE, USB_DEVICE, USB_SERIAL},
    stream::{write_all_within, Transport, WriteError},
    waveform::DAC_LINES,
};

/// Cycles the trigger program adds to every requested delay. Measured on the bench, and only
/// valid for [`trigger_program`].
pub const PIO_OVERHEAD_CYCLES: u32 = 5;

/// A DAC output line, configured as SIO push-pull output
pub type DacLine = Pin<DynPinId, FunctionSioOutput, PullDown>;

/// Trigger program: wait for a delay, count it down, raise IRQ 0, repeat.
///
/// Blocking on the pull keeps the state machine idle between sequences.
pub fn trigger_program() -> pio::Program<32> {
    let mut a = pio::Assembler::<32>::new();
    let mut wrap_target = a.label();
    let mut wrap_source = a.label();
    let mut count_down = a.label();

    a.bind(&mut wrap_target);
    a.pull(false, true);
    a.mov(
        pio::MovDestination::X,
        pio::MovOperation::None,
        pio::MovSource::OSR,
    );
    a.bind(&mut count_down);
    a.jmp(pio::JmpCondition::XDecNonZero, &mut count_down);
    a.irq(false, false, 0, false);
    a.bind(&mut wrap_source);

    a.assemble_with_wrap(wrap_source, wrap_target)
}

/// Trigger errors
#[derive(Debug, Copy, Clone, PartialEq, Eq, Format)]
pub enum PioError {
    /// The TX FIFO already holds 4 pending delays
    FifoFull,
    /// [`TICK_HARDWARE`] has not been initialized
    NotInstalled,
}

/// Trigger running on PIO0 SM0
pub struct PioTrigger {
    /// Block owning the IRQ flags
    pio: PIO<pac::PIO0>,
    /// Delay FIFO
    tx: Tx<(pac::PIO0, SM0)>,
    /// Kept so the state machine is never reconfigured
    _sm: StateMachine<(pac::PIO0, SM0), Running>,
}

impl PioTrigger {
    /// Install [`trigger_program`], start it, and route its IRQ 0 to `PIO0_IRQ_0`.
    pub fn start(
        mut pio: PIO<pac::PIO0>,
        sm0: UninitStateMachine<(pac::PIO0, SM0)>,
    ) -> Result<Self, InstallError> {
        let installed = pio.install(&trigger_program())?;
        let (sm, _rx, tx) = PIOBuilder::from_installed_program(installed).build(sm0);
        pio.irq0().enable_sm_interrupt(0);
        debug!("Trigger program installed on PIO0 SM0");
        Ok(Self {
            pio,
            tx,
            _sm: sm.start(),
        })
    }
}

impl Trigger for PioTrigger {
    type Error = PioError;

    fn arm(&mut self, cycles: u32) -> Result<(), PioError> {
        if self.tx.write(cycles) {
            Ok(())
        } else {
            Err(PioError::FifoFull)
        }
    }

    fn acknowledge(&mut self) {
        self.pio.clear_irq(1 << 0);
    }
}

/// Handle for arming the [`PioTrigger`] held in [`TICK_HARDWARE`] from the main loop
#[derive(Default)]
pub struct SharedTrigger;

impl Trigger for SharedTrigger {
    type Error = PioError;

    fn arm(&mut self, cycles: u32) -> Result<(), PioError> {
        critical_section::with(|cs| {
            TICK_HARDWARE
                .borrow_ref_mut(cs)
                .as_mut()
                .ok_or(PioError::NotInstalled)?
                .trigger
                .arm(cycles)
        })
    }

    fn acknowledge(&mut self) {
        critical_section::with(|cs| {
            if let Some(hardware) = TICK_HARDWARE.borrow_ref_mut(cs).as_mut() {
                hardware.trigger.acknowledge()
            }
        })
    }
}

/// GPIO-ladder DAC on the [`DAC_LINES`] pins
pub struct SioDac {
    /// Output lines, held so they stay configured
    _lines: [DacLine; 8],
}

impl SioDac {
    /// Take the DAC lines, ordered from least to most significant bit.
    pub fn new(lines: [DacLine; 8]) -> Self {
        for (line, expected) in lines.iter().zip(DAC_LINES) {
            debug_assert_eq!(line.id().num, expected, "DAC line out of order");
        }
        Self { _lines: lines }
    }
}

impl WaveformOutput for SioDac {
    #[inline(always)]
    fn write_masked(&mut self, mask: u32, pattern: u32) {
        // SAFETY: GPIO_OUT_XOR is an atomic alias, and only lines in `mask` are flipped
        let sio = unsafe { &*pac::SIO::ptr() };
        let current = sio.gpio_out().read().bits();
        sio.gpio_out_xor()
            .write(|w| unsafe { w.bits((current ^ pattern) & mask) });
    }
}

/// ADC performing one conversion per read
pub struct OneShotAdc {
    /// Raw ADC block, released from the HAL after setup
    adc: pac::ADC,
}

impl OneShotAdc {
    /// Select `channel` on an initialized ADC.
    pub fn new(adc: Adc, channel: u8) -> Self {
        let adc = adc.free();
        adc.cs().modify(|_, w| unsafe { w.ainsel().bits(channel) });
        Self { adc }
    }
}

impl SampleSource for OneShotAdc {
    #[inline(always)]
    fn read_sample(&mut self) -> Sample {
        self.adc.cs().modify(|_, w| w.start_once().set_bit());
        // 96 ADC clocks, ~2 µs
        while self.adc.cs().read().ready().bit_is_clear() {}
        self.adc.result().read().result().bits()
    }
}

/// Everything serviced by `PIO0_IRQ_0`
pub struct TickHardware {
    /// Tick source
    pub trigger: PioTrigger,
    /// Excitation output
    pub dac: SioDac,
    /// Acquisition input
    pub adc: OneShotAdc,
}

impl TickHardware {
    /// Service one tick of `engine`
    #[inline(always)]
    pub fn service<const N: usize>(&mut self, engine: &Engine<N>) {
        engine.on_tick(&mut self.trigger, &mut self.dac, &mut self.adc);
    }
}

/// Time the host may leave the serial port full before output is dropped
pub const WRITE_STALL_LIMIT_US: u64 = 500_000;

/// Writer/non-blocking reader on [`USB_SERIAL`]
pub struct UsbTransport {
    /// Clock for the write stall limit
    timer: Timer,
}

impl UsbTransport {
    /// Transport using `timer` to time out stalled writes
    pub fn new(timer: Timer) -> Self {
        Self { timer }
    }

    /// Read whatever the host has sent, up to `buf.len()` bytes.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        critical_section::with(|cs| {
            USB_SERIAL
                .borrow_ref_mut(cs)
                .as_mut()
                .and_then(|serial| serial.read(buf).ok())
                .unwrap_or(0)
        })
    }
}

impl Transport for UsbTransport {
    type Error = WriteError<UsbError>;

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), WriteError<UsbError>> {
        let timer = &self.timer;
        write_all_within(
            bytes,
            WRITE_STALL_LIMIT_US,
            || timer.get_counter().ticks(),
            |chunk: &[u8]| {
                critical_section::with(|cs| {
                    let configured = USB_DEVICE
                        .borrow_ref(cs)
                        .as_ref()
                        .is_some_and(|device| device.state() == UsbDeviceState::Configured);
                    if !configured {
                        return Err(UsbError::InvalidState);
                    }
                    let mut serial = USB_SERIAL.borrow_ref_mut(cs);
                    let serial = serial.as_mut().ok_or(UsbError::InvalidState)?;
                    match serial.write(chunk) {
                        Ok(count) => Ok(Some(count)),
                        // Endpoint busy, the USB interrupt will free it
                        Err(UsbError::WouldBlock) => Ok(None),
                        Err(err) => Err(err),
                    }
                })
            },
        )
    }
}
