//! Full measurements on a simulated rig, driven the way the firmware main loop drives them.

use std::{cell::RefCell, convert::Infallible, rc::Rc};

use embedded_hal::{
    delay::DelayNs,
    digital::{ErrorType, OutputPin},
};
use nmr_pulse_engine::{
    buffer::Sample,
    command::LineReader,
    components::{SampleSource, Trigger, WaveformOutput},
    engine::Engine,
    experiment::{Experiment, ExperimentPlan, Rig, RunReport},
    stream::{Transport, FRAME_SENTINEL},
    timing::TimingConfig,
    waveform::{WaveformTable, SINE_16},
};

const PICO: TimingConfig = TimingConfig {
    system_clock_hz: 125_000_000,
    overhead_cycles: 5,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Event {
    Polarization(bool),
    ReadWrite(bool),
    Dac(u8),
    Sample(Sample),
}

/// Shared bench state: simulated time, armed delays and everything the hardware did
#[derive(Default)]
struct Bench {
    now_ns: u64,
    armed: u32,
    next_sample: Sample,
    events: Vec<(u64, Event)>,
}

type Shared = Rc<RefCell<Bench>>;

struct Relay {
    bench: Shared,
    event: fn(bool) -> Event,
}

impl ErrorType for Relay {
    type Error = Infallible;
}

impl OutputPin for Relay {
    fn set_low(&mut self) -> Result<(), Infallible> {
        let mut bench = self.bench.borrow_mut();
        let now = bench.now_ns;
        bench.events.push((now, (self.event)(false)));
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        let mut bench = self.bench.borrow_mut();
        let now = bench.now_ns;
        bench.events.push((now, (self.event)(true)));
        Ok(())
    }
}

struct SimTrigger(Shared);

impl Trigger for SimTrigger {
    type Error = Infallible;

    fn arm(&mut self, _cycles: u32) -> Result<(), Infallible> {
        self.0.borrow_mut().armed += 1;
        Ok(())
    }

    fn acknowledge(&mut self) {}
}

struct SimDac {
    bench: Shared,
    table: WaveformTable,
}

impl WaveformOutput for SimDac {
    fn write_masked(&mut self, mask: u32, pattern: u32) {
        assert_eq!(mask, self.table.mask());
        let mut bench = self.bench.borrow_mut();
        let now = bench.now_ns;
        bench.events.push((now, Event::Dac(self.table.decode(pattern))));
    }
}

struct SimAdc(Shared);

impl SampleSource for SimAdc {
    fn read_sample(&mut self) -> Sample {
        let mut bench = self.0.borrow_mut();
        let sample = bench.next_sample;
        bench.next_sample += 1;
        let now = bench.now_ns;
        bench.events.push((now, Event::Sample(sample)));
        sample
    }
}

/// Delay that advances simulated time and fires up to `burst` armed ticks per call, standing in
/// for the trigger interrupt preempting the main loop
struct SimDelay {
    engine: &'static Engine<256>,
    bench: Shared,
    burst: u32,
}

impl DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.bench.borrow_mut().now_ns += u64::from(ns);
        let mut trigger = SimTrigger(self.bench.clone());
        let mut dac = SimDac {
            bench: self.bench.clone(),
            table: WaveformTable::new(),
        };
        let mut adc = SimAdc(self.bench.clone());
        for _ in 0..self.burst {
            {
                let mut bench = self.bench.borrow_mut();
                if bench.armed == 0 {
                    break;
                }
                bench.armed -= 1;
            }
            self.engine.on_tick(&mut trigger, &mut dac, &mut adc);
        }
    }
}

#[derive(Default)]
struct Host {
    bytes: Vec<u8>,
}

impl Transport for Host {
    type Error = Infallible;

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Infallible> {
        self.bytes.extend_from_slice(bytes);
        Ok(())
    }
}

/// Host output split around the sample frame
struct Reply {
    before: String,
    samples: Vec<Sample>,
    after: String,
}

fn split_reply(bytes: &[u8]) -> Reply {
    let sentinel = FRAME_SENTINEL.to_le_bytes();
    let open = bytes
        .windows(2)
        .position(|pair| pair == sentinel)
        .expect("no opening sentinel");
    let body = &bytes[open + 2..];
    let close = body
        .chunks_exact(2)
        .position(|pair| pair == sentinel)
        .expect("no closing sentinel");
    Reply {
        before: String::from_utf8(bytes[..open].to_vec()).unwrap(),
        samples: body[..close * 2]
            .chunks_exact(2)
            .map(|pair| Sample::from_le_bytes([pair[0], pair[1]]))
            .collect(),
        after: String::from_utf8(body[close * 2 + 2..].to_vec()).unwrap(),
    }
}

fn experiment(
    engine: &'static Engine<256>,
    bench: &Shared,
    burst: u32,
) -> Experiment<Relay, Relay, SimTrigger, SimDelay> {
    experiment_with_plan(engine, bench, burst, ExperimentPlan::default())
}

fn experiment_with_plan(
    engine: &'static Engine<256>,
    bench: &Shared,
    burst: u32,
    plan: ExperimentPlan,
) -> Experiment<Relay, Relay, SimTrigger, SimDelay> {
    let rig = Rig {
        polarization: Relay {
            bench: bench.clone(),
            event: Event::Polarization,
        },
        read_write: Relay {
            bench: bench.clone(),
            event: Event::ReadWrite,
        },
        trigger: SimTrigger(bench.clone()),
        delay: SimDelay {
            engine,
            bench: bench.clone(),
            burst,
        },
    };
    Experiment::new(rig, plan, PICO)
}

/// Feed a host line through the line reader and answer it
fn send(
    experiment: &mut Experiment<Relay, Relay, SimTrigger, SimDelay>,
    engine: &'static Engine<256>,
    line: &str,
    host: &mut Host,
) -> Option<RunReport> {
    let mut reader = LineReader::new();
    let mut reply = None;
    for &byte in line.as_bytes() {
        if let Some(command) = reader.push(byte) {
            reply = Some(experiment.respond(engine, command, host).unwrap());
        }
    }
    reply.expect("line was not terminated")
}

#[test]
fn full_measurement() {
    static ENGINE: Engine<256> = Engine::new();
    let bench = Shared::default();
    let mut experiment = experiment(&ENGINE, &bench, 1);
    let mut host = Host::default();

    let report = send(&mut experiment, &ENGINE, "NMR(50,100)\r\n", &mut host).unwrap();
    assert_eq!(report.excitation.total_ticks, 1360);
    assert_eq!(report.acquisition.total_ticks, 1000);
    assert_eq!(report.acquisition.cycles_per_tick, 12_495);
    assert_eq!(report.samples, 1000);
    assert_eq!(report.overruns, 0);

    let reply = split_reply(&host.bytes);
    assert_eq!(
        reply.before,
        "COMMAND RECEIVED: Pulse=50ms, Read=100ms\n\
         STATUS: Polarizing coil ON for 5000 ms...\n\
         STATUS: Polarization complete.\n\
         STATUS: Setting relay to WRITE mode...\n\
         STATUS: Starting excitation pulse...\n\
         STATUS: Pulse finished.\n\
         STATUS: Setting relay to READ mode...\n\
         STATUS: Starting data read at 10000 SPS...\n"
    );
    assert_eq!(reply.samples, (0..1000).collect::<Vec<Sample>>());
    assert_eq!(
        reply.after,
        "STATUS: Data read complete. Sequence finished.\n\
         NMR Controller Ready. Waiting for commands...\n"
    );

    let bench = bench.borrow();
    let events: Vec<Event> = bench.events.iter().map(|&(_, event)| event).collect();
    assert_eq!(
        events[..3],
        [
            Event::Polarization(true),
            Event::Polarization(false),
            Event::ReadWrite(true)
        ]
    );
    // Polarization held for the full 5 s
    assert_eq!(bench.events[1].0 - bench.events[0].0, 5_000_000_000);

    let pulse = &events[3..3 + 1360];
    for (tick, event) in pulse.iter().enumerate() {
        assert_eq!(*event, Event::Dac(SINE_16[tick % 16]));
    }
    assert_eq!(events[3 + 1360], Event::ReadWrite(false));
    // Relay settles before sampling starts
    let switched_at = bench.events[3 + 1360].0;
    assert!(bench.events[3 + 1361].0 - switched_at >= 10_000_000);
    assert!(events[3 + 1361..]
        .iter()
        .all(|event| matches!(event, Event::Sample(_))));
    assert_eq!(events.len(), 3 + 1360 + 1 + 1000);
    assert!(ENGINE.is_complete());
}

#[test]
fn zero_length_measurement_sends_empty_frame() {
    static ENGINE: Engine<256> = Engine::new();
    let bench = Shared::default();
    let mut experiment = experiment(&ENGINE, &bench, 1);
    let mut host = Host::default();

    let report = send(&mut experiment, &ENGINE, "NMR(0,0)\n", &mut host).unwrap();
    assert_eq!(report.excitation.total_ticks, 0);
    assert_eq!(report.samples, 0);

    let reply = split_reply(&host.bytes);
    assert!(reply.samples.is_empty());
    assert!(reply.before.contains("STATUS: Pulse finished.\n"));
    assert!(reply.after.ends_with("NMR Controller Ready. Waiting for commands...\n"));
    assert_eq!(bench.borrow().armed, 0);
}

#[test]
fn slow_stream_reports_overruns() {
    static ENGINE: Engine<256> = Engine::new();
    let bench = Shared::default();
    // 300 ticks between drains, more than the ring holds
    let mut experiment = experiment(&ENGINE, &bench, 300);
    let mut host = Host::default();

    let report = send(&mut experiment, &ENGINE, "NMR(10,100)\n", &mut host).unwrap();
    assert_eq!(report.samples + report.overruns, 1000);
    assert_eq!(report.overruns, 3 * (300 - 256));

    let reply = split_reply(&host.bytes);
    assert_eq!(reply.samples.len(), report.samples as usize);
    assert_eq!(reply.samples.last(), Some(&999));
    assert!(reply.samples.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn bad_command_then_good_command() {
    static ENGINE: Engine<256> = Engine::new();
    let bench = Shared::default();
    let mut experiment = experiment(&ENGINE, &bench, 1);
    let mut host = Host::default();

    assert_eq!(send(&mut experiment, &ENGINE, "NMR(abc)\n", &mut host), None);
    assert_eq!(
        String::from_utf8(host.bytes.clone()).unwrap(),
        "ERROR: Invalid command format. Use: NMR(pulse_ms,read_ms)\n"
    );
    assert!(bench.borrow().events.is_empty());

    host.bytes.clear();
    let report = send(&mut experiment, &ENGINE, "NMR(1,1)\n", &mut host).unwrap();
    // 1701 Hz * 16 * 1 ms, 10 kHz * 1 ms
    assert_eq!(report.excitation.total_ticks, 27);
    assert_eq!(report.samples, 10);
}

#[test]
fn acquisition_longer_than_u32_microseconds() {
    static ENGINE: Engine<256> = Engine::new();
    let bench = Shared::default();
    let plan = ExperimentPlan {
        polarize_ms: 0,
        acquisition_hz: 10,
        stream_poll_us: 100_000,
        ..ExperimentPlan::default()
    };
    let mut experiment = experiment_with_plan(&ENGINE, &bench, 1, plan);
    let mut host = Host::default();

    // 73 minutes at 10 Hz
    let report = send(&mut experiment, &ENGINE, "NMR(0,4400000)\n", &mut host).unwrap();
    assert_eq!(report.acquisition.total_ticks, 44_000);
    assert_eq!(report.samples, 44_000);
    assert_eq!(report.overruns, 0);
    assert!(bench.borrow().now_ns > u64::from(u32::MAX) * 1_000);

    let reply = split_reply(&host.bytes);
    assert_eq!(reply.samples.len(), 44_000);
    assert!(reply.after.starts_with("STATUS: Data read complete."));
}
