//! Firmware for the NMR controller: accepts `NMR(pulse_ms,read_ms)` over USB serial, runs the
//! measurement and streams the samples back.
#![no_std]
#![no_main]
#![doc(html_playground_url = "https://play.rust-lang.org/")]
#![warn(missing_docs)]

use cortex_m::singleton;
use defmt::{info, warn, Debug2Format};
#[allow(unused_imports)]
use defmt_rtt as _;
use embedded_hal::{delay::DelayNs, digital::PinState};
#[allow(unused_imports)]
use panic_probe as _;
use rp2040_hal::{
    adc::{Adc, AdcPin},
    clocks::init_clocks_and_plls,
    entry,
    gpio::Pins,
    pac,
    pac::interrupt,
    pio::PIOExt,
    usb::UsbBus,
    Clock, Sio, Timer, Watchdog,
};
use usb_device::{
    class_prelude::UsbBusAllocator,
    device::{StringDescriptors, UsbDeviceBuilder, UsbVidPid},
};
use usbd_serial::SerialPort;

use nmr_pulse_engine::{
    command::LineReader,
    experiment::{Experiment, ExperimentPlan, Rig, READY_MESSAGE},
    interrupt::{ENGINE, TICK_HARDWARE, USB_DEVICE, USB_SERIAL},
    rp2040::{
        OneShotAdc, PioTrigger, SharedTrigger, SioDac, TickHardware, UsbTransport,
        PIO_OVERHEAD_CYCLES,
    },
    stream::write_line,
    timing::TimingConfig,
};

/// Second-stage bootloader, from [rp2040-boot2](https://docs.rs/rp2040-boot2)
#[link_section = ".boot2"]
#[used]
pub static BOOT2: [u8; 256] = rp2040_boot2::BOOT_LOADER_W25Q080;
/// External high-speed crystal on the pico board is 12Mhz
pub const XOSC_FREQ_HZ: u32 = 12_000_000;
/// ADC input 1 is GPIO27
pub const ADC_CHANNEL: u8 = 1;
/// Time for the host to open the serial port after flashing
pub const STARTUP_DELAY_MS: u32 = 4_000;

/// Main operation loop
#[entry]
fn main() -> ! {
    info!("NMR controller startup");
    let mut pac = pac::Peripherals::take().unwrap();
    let mut watchdog = Watchdog::new(pac.WATCHDOG);
    let sio = Sio::new(pac.SIO);

    let clocks = init_clocks_and_plls(
        XOSC_FREQ_HZ,
        pac.XOSC,
        pac.CLOCKS,
        pac.PLL_SYS,
        pac.PLL_USB,
        &mut pac.RESETS,
        &mut watchdog,
    )
    .ok()
    .unwrap();
    let timing = TimingConfig {
        system_clock_hz: clocks.system_clock.freq().to_Hz(),
        overhead_cycles: PIO_OVERHEAD_CYCLES,
    };
    info!("System clock at {=u32} Hz", timing.system_clock_hz);
    let mut timer = Timer::new(pac.TIMER, &mut pac.RESETS, &clocks);

    // USB serial, polled from USBCTRL_IRQ
    let usb_bus = singleton!(: UsbBusAllocator<UsbBus> = UsbBusAllocator::new(UsbBus::new(
        pac.USBCTRL_REGS,
        pac.USBCTRL_DPRAM,
        clocks.usb_clock,
        true,
        &mut pac.RESETS,
    )))
    .unwrap();
    let serial = SerialPort::new(usb_bus);
    let usb_device = UsbDeviceBuilder::new(usb_bus, UsbVidPid(0x16c0, 0x27dd))
        .strings(&[StringDescriptors::default()
            .manufacturer("NMR lab")
            .product("NMR controller")
            .serial_number("0001")])
        .unwrap()
        .device_class(usbd_serial::USB_CLASS_CDC)
        .build();
    critical_section::with(|cs| {
        USB_SERIAL.replace(cs, Some(serial));
        USB_DEVICE.replace(cs, Some(usb_device));
    });

    let pins = Pins::new(
        pac.IO_BANK0,
        pac.PADS_BANK0,
        sio.gpio_bank0,
        &mut pac.RESETS,
    );

    // Relays start released
    let polarization = pins.gpio26.into_push_pull_output_in_state(PinState::Low);
    let read_write = pins.gpio28.into_push_pull_output_in_state(PinState::Low);

    // DAC lines, LSB first, matching waveform::DAC_LINES
    let dac = SioDac::new([
        pins.gpio29.into_push_pull_output().into_dyn_pin(),
        pins.gpio6.into_push_pull_output().into_dyn_pin(),
        pins.gpio7.into_push_pull_output().into_dyn_pin(),
        pins.gpio0.into_push_pull_output().into_dyn_pin(),
        pins.gpio1.into_push_pull_output().into_dyn_pin(),
        pins.gpio2.into_push_pull_output().into_dyn_pin(),
        pins.gpio4.into_push_pull_output().into_dyn_pin(),
        pins.gpio3.into_push_pull_output().into_dyn_pin(),
    ]);

    let adc = Adc::new(pac.ADC, &mut pac.RESETS);
    let _adc_pin = AdcPin::new(pins.gpio27.into_floating_input()).unwrap();
    let adc = OneShotAdc::new(adc, ADC_CHANNEL);

    let (pio0, sm0, _, _, _) = pac.PIO0.split(&mut pac.RESETS);
    let trigger = PioTrigger::start(pio0, sm0).unwrap();
    critical_section::with(|cs| {
        TICK_HARDWARE.replace(cs, Some(TickHardware { trigger, dac, adc }))
    });

    unsafe {
        pac::NVIC::unmask(pac::Interrupt::USBCTRL_IRQ);
        pac::NVIC::unmask(pac::Interrupt::PIO0_IRQ_0);
    }

    let mut host = UsbTransport::new(timer);
    let mut reader = LineReader::new();

    timer.delay_ms(STARTUP_DELAY_MS);
    if write_line(&mut host, format_args!("{}", READY_MESSAGE)).is_err() {
        warn!("Host not connected yet");
    }

    let mut experiment = Experiment::new(
        Rig {
            polarization,
            read_write,
            trigger: SharedTrigger,
            delay: timer,
        },
        ExperimentPlan::default(),
        timing,
    );

    let mut received = [0u8; 64];
    loop {
        let count = host.read(&mut received);
        for &byte in &received[..count] {
            if let Some(line) = reader.push(byte) {
                if let Err(err) = experiment.respond(&ENGINE, line, &mut host) {
                    warn!("Lost host connection: {}", Debug2Format(&err));
                }
            }
        }
    }
}

/// Trigger tick: output the next DAC point or capture the next sample
#[interrupt]
fn PIO0_IRQ_0() {
    critical_section::with(|cs| {
        if let Some(hardware) = TICK_HARDWARE.borrow_ref_mut(cs).as_mut() {
            hardware.service(&ENGINE);
        }
    });
}

/// Keep the USB device and serial class serviced
#[interrupt]
fn USBCTRL_IRQ() {
    critical_section::with(|cs| {
        let mut device = USB_DEVICE.borrow_ref_mut(cs);
        let mut serial = USB_SERIAL.borrow_ref_mut(cs);
        if let (Some(device), Some(serial)) = (device.as_mut(), serial.as_mut()) {
            device.poll(&mut [serial]);
        }
    });
}
