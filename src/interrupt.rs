//! Statics shared between the main loop and interrupt handlers.

use crate::{buffer::RING_BUFFER_SIZE, engine::Engine};

/// The trigger engine. All of its shared state is atomic, so it needs no critical section.
pub static ENGINE: Engine<RING_BUFFER_SIZE> = Engine::new();

#[cfg(feature = "rp2040")]
pub use self::rp2040::*;

/// Peripherals owned by interrupt handlers
#[cfg(feature = "rp2040")]
mod rp2040 {
    use core::cell::RefCell;

    use critical_section::Mutex;
    use rp2040_hal::usb::UsbBus;
    use usb_device::device::UsbDevice;
    use usbd_serial::SerialPort;

    use crate::rp2040::TickHardware;

    /// PIO trigger, DAC lines and ADC, serviced by `PIO0_IRQ_0`
    pub static TICK_HARDWARE: Mutex<RefCell<Option<TickHardware>>> =
        Mutex::new(RefCell::new(None));

    /// USB device, polled by `USBCTRL_IRQ`
    pub static USB_DEVICE: Mutex<RefCell<Option<UsbDevice<'static, UsbBus>>>> =
        Mutex::new(RefCell::new(None));

    /// Serial class carrying commands, status lines and samples
    pub static USB_SERIAL: Mutex<RefCell<Option<SerialPort<'static, UsbBus>>>> =
        Mutex::new(RefCell::new(None));
}
