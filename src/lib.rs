//! This [RP2040](https://docs.rs/rp2040-hal) project drives a pulsed NMR experiment: a PIO
//! state machine paces a sine excitation through a GPIO-ladder DAC, then paces ADC sampling of
//! the response, which is streamed to the host over USB serial.
//!
//! The real-time part is the [`engine::Engine`]. It converts a frequency and duration into
//! trigger timing ([`timing`]), services every trigger tick from interrupt context, and hands
//! captured samples to the main loop through a lock-free [`buffer::RingBuffer`].
//!
//! ## Crate features
//!
//! - `rp2040`: Builds the [`rp2040`] hardware layer and the firmware binary. Enables `defmt`.
//! - `defmt`: Sends log messages through [defmt](https://docs.rs/defmt) rather than
//!   [log](https://docs.rs/log).
//! - `trace_ticks`: Logs every serviced tick. Very noisy! Excitation ticks arrive every ~37 µs,
//!   which RTT logging cannot keep up with, so expect the output waveform to stretch.
//!
//! ## Demo
//!
//! Hardware-independent use of the engine, with the tick interrupt simulated by a loop:
//!
//! ```
//! use nmr_pulse_engine::{
//!     components::{SampleSource, Trigger, WaveformOutput},
//!     engine::Engine,
//!     timing::TimingConfig,
//! };
//!
//! struct Pio(u32);
//! impl Trigger for Pio {
//!     type Error = ();
//!     fn arm(&mut self, _cycles: u32) -> Result<(), ()> {
//!         self.0 += 1;
//!         Ok(())
//!     }
//!     fn acknowledge(&mut self) {}
//! }
//! struct Lines;
//! impl WaveformOutput for Lines {
//!     fn write_masked(&mut self, _mask: u32, _pattern: u32) {}
//! }
//! struct Adc;
//! impl SampleSource for Adc {
//!     fn read_sample(&mut self) -> u16 {
//!         2048
//!     }
//! }
//!
//! static ENGINE: Engine<256> = Engine::new();
//! let timing = TimingConfig { system_clock_hz: 125_000_000, overhead_cycles: 5 };
//!
//! let mut pio = Pio(0);
//! ENGINE.begin_acquisition(10_000, 10, &timing, &mut pio).unwrap();
//! let mut streamed = 0;
//! while !ENGINE.is_complete() {
//!     // PIO0_IRQ_0
//!     ENGINE.on_tick(&mut pio, &mut Lines, &mut Adc);
//!     streamed += ENGINE.drain_available_samples().count();
//! }
//! assert_eq!(streamed, 100);
//! ```

// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), feature(doc_auto_cfg), feature(doc_cfg_hide))]

#[macro_use]
mod fmt;

pub mod buffer;
pub mod command;
pub mod components;
pub mod engine;
pub mod experiment;
pub mod interrupt;
#[cfg(feature = "rp2040")]
pub mod rp2040;
pub mod stream;
pub mod timing;
pub mod waveform;
