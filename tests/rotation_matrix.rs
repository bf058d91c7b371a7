use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use busprobe::{
    core::{
        AbortSignal, BaudSweep, ConsoleReporter, HarnessError, MatrixDriver, OperationKind,
        PermutationReport, ReadError, Reporter, RotationEngine, RotationSettings, SlaveConfiguration,
        SlaveState, SpawnError, StopError, TransactionError,
    },
    protocol::{ModbusMaster, ReadRequest, SlaveLauncher, SlaveProcess, WriteRequest},
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Spawn(String),
    Stop(String),
    Write { master: String, address: u8 },
    Read { master: String, address: u8 },
}

struct Emulator {
    address: u8,
    baud_rate: u32,
    registers: HashMap<u16, i64>,
}

/// In-memory stand-in for the RS-485 bus, the emulators and the master tool.
#[derive(Default)]
struct Bus {
    events: Vec<Event>,
    live: HashMap<String, Emulator>,
    spawned: usize,
    stopped: usize,
    /// (master port, slave port) pairs whose emulator rejects writes.
    reject_writes: HashSet<(String, String)>,
    /// Ports whose emulator cannot be started.
    unavailable: HashSet<String>,
    /// Reads issued while this port is master panic.
    panic_on_read_from: Option<String>,
    /// Trigger the abort signal when the n-th write (1-based) is issued.
    abort_on_write: Option<(usize, AbortSignal)>,
    writes_seen: usize,
}

type SharedBus = Arc<Mutex<Bus>>;

struct FakeLauncher(SharedBus);

struct FakeSlave {
    port: String,
    state: SlaveState,
    bus: SharedBus,
}

impl SlaveLauncher for FakeLauncher {
    fn start(&self, config: &SlaveConfiguration) -> Result<Box<dyn SlaveProcess>, SpawnError> {
        let mut bus = self.0.lock();
        if bus.unavailable.contains(&config.port) || bus.live.contains_key(&config.port) {
            return Err(SpawnError::Launch {
                port: config.port.clone(),
                message: "Device or resource busy".to_string(),
            });
        }
        bus.spawned += 1;
        bus.events.push(Event::Spawn(config.port.clone()));
        bus.live.insert(
            config.port.clone(),
            Emulator {
                address: config.address,
                baud_rate: config.baud_rate,
                registers: HashMap::new(),
            },
        );
        Ok(Box::new(FakeSlave {
            port: config.port.clone(),
            state: SlaveState::Starting,
            bus: self.0.clone(),
        }))
    }
}

#[async_trait]
impl SlaveProcess for FakeSlave {
    fn port(&self) -> &str {
        &self.port
    }

    fn state(&self) -> SlaveState {
        self.state
    }

    fn confirm_running(&mut self) -> Result<(), SpawnError> {
        self.state = SlaveState::Running;
        Ok(())
    }

    async fn stop(&mut self, _grace: Duration) -> Result<(), StopError> {
        if self.state != SlaveState::Terminated {
            let mut bus = self.bus.lock();
            bus.live.remove(&self.port);
            bus.stopped += 1;
            bus.events.push(Event::Stop(self.port.clone()));
            self.state = SlaveState::Terminated;
        }
        Ok(())
    }
}

struct FakeMaster(SharedBus);

fn no_reply() -> TransactionError {
    TransactionError::Failed {
        status: "exit status: 1".to_string(),
        stderr: "Reply time-out!".to_string(),
    }
}

fn addressed<'a>(
    bus: &'a mut Bus,
    master: &str,
    address: u8,
    baud_rate: u32,
) -> Option<(&'a String, &'a mut Emulator)> {
    bus.live
        .iter_mut()
        .find(|(port, e)| port.as_str() != master && e.address == address && e.baud_rate == baud_rate)
}

#[async_trait]
impl ModbusMaster for FakeMaster {
    async fn write(&self, request: &WriteRequest) -> Result<(), TransactionError> {
        let mut bus = self.0.lock();
        let target = &request.target;
        bus.events.push(Event::Write {
            master: target.port.clone(),
            address: target.address,
        });
        bus.writes_seen += 1;
        if let Some((n, signal)) = &bus.abort_on_write {
            if *n == bus.writes_seen {
                signal.trigger();
            }
        }

        let rejected = bus.reject_writes.clone();
        let Some((port, emulator)) = addressed(&mut bus, &target.port, target.address, target.baud_rate)
        else {
            return Err(no_reply());
        };
        if rejected.contains(&(target.port.clone(), port.clone())) {
            return Err(TransactionError::Failed {
                status: "exit status: 1".to_string(),
                stderr: "Illegal Data Address exception response!".to_string(),
            });
        }
        for (offset, value) in request.registers.values.iter().enumerate() {
            emulator
                .registers
                .insert(request.registers.start + offset as u16, *value);
        }
        Ok(())
    }

    async fn read(&self, request: &ReadRequest) -> Result<Vec<i64>, ReadError> {
        let mut bus = self.0.lock();
        let target = &request.target;
        bus.events.push(Event::Read {
            master: target.port.clone(),
            address: target.address,
        });
        if bus.panic_on_read_from.as_deref() == Some(target.port.as_str()) {
            panic!("bus fault injected for {}", target.port);
        }
        let Some((_, emulator)) = addressed(&mut bus, &target.port, target.address, target.baud_rate)
        else {
            return Err(no_reply().into());
        };
        Ok((request.start..request.start + request.count)
            .map(|register| emulator.registers.get(&register).copied().unwrap_or(0))
            .collect())
    }
}

fn ports(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("/dev/ttyUSB{i}")).collect()
}

fn settings() -> RotationSettings {
    RotationSettings {
        settle: Duration::ZERO,
        timeout: Duration::from_millis(50),
        ..RotationSettings::default()
    }
}

fn engine_with(bus: &SharedBus, abort: AbortSignal, reporter: Arc<dyn Reporter>) -> RotationEngine {
    RotationEngine::new(
        Arc::new(FakeLauncher(bus.clone())),
        Arc::new(FakeMaster(bus.clone())),
        reporter,
        settings(),
        abort,
    )
}

fn engine(bus: &SharedBus) -> RotationEngine {
    engine_with(bus, AbortSignal::new(), Arc::new(ConsoleReporter))
}

fn count(report: &PermutationReport, kind: OperationKind, success: bool) -> usize {
    report
        .results_of(kind)
        .filter(|r| r.success == success)
        .count()
}

#[tokio::test]
async fn test_four_ports_at_9600_all_pass() {
    let bus = SharedBus::default();
    let driver = MatrixDriver::new(engine(&bus));

    let outcome = driver.run(&ports(4), &BaudSweep::new([9600])).await;

    assert_eq!(outcome.reports.len(), 4);
    for (i, report) in outcome.reports.iter().enumerate() {
        assert_eq!(report.master_port, format!("/dev/ttyUSB{i}"));
        assert_eq!(report.baud_rate, 9600);
        assert_eq!(count(report, OperationKind::Write, true), 3);
        assert_eq!(count(report, OperationKind::Read, true), 3);
        assert!(report.all_passed());
    }
    assert!(outcome.summary.all_passed());
    assert_eq!(outcome.summary.total.writes_passed, 12);
    assert_eq!(outcome.summary.total.reads_passed, 12);

    let bus = bus.lock();
    assert_eq!(bus.spawned, 12);
    assert_eq!(bus.stopped, bus.spawned);
    assert!(bus.live.is_empty());
}

#[tokio::test]
async fn test_read_back_returns_canonical_payload_in_order() {
    let bus = SharedBus::default();
    let report = engine(&bus)
        .run(&ports(2), 9600)
        .await
        .unwrap()
        .remove(0);
    assert!(report.all_passed());

    // Same transactions, directly against a fresh emulator.
    let launcher = FakeLauncher(bus.clone());
    let master = FakeMaster(bus.clone());
    let mut slave = launcher
        .start(&SlaveConfiguration {
            port: "/dev/ttyUSB1".to_string(),
            baud_rate: 9600,
            parity: Default::default(),
            mode: Default::default(),
            address: 1,
        })
        .unwrap();
    let target = busprobe::protocol::MasterTarget {
        port: "/dev/ttyUSB0".to_string(),
        baud_rate: 9600,
        timeout: Duration::from_secs(1),
        parity: Default::default(),
        mode: Default::default(),
        address: 1,
    };
    master
        .write(&WriteRequest {
            target: target.clone(),
            registers: busprobe::core::RegisterSet::canonical(500, 10),
        })
        .await
        .unwrap();
    let values = master
        .read(&ReadRequest {
            target,
            start: 500,
            count: 10,
        })
        .await
        .unwrap();
    assert_eq!(values, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    slave.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_all_writes_precede_reads_within_each_permutation() {
    let bus = SharedBus::default();
    engine(&bus).run(&ports(4), 9600).await.unwrap();

    let events = bus.lock().events.clone();
    for master in ports(4) {
        let ops: Vec<&Event> = events
            .iter()
            .filter(|e| match e {
                Event::Write { master: m, .. } | Event::Read { master: m, .. } => *m == master,
                _ => false,
            })
            .collect();
        assert_eq!(
            ops,
            vec![
                &Event::Write { master: master.clone(), address: 1 },
                &Event::Write { master: master.clone(), address: 2 },
                &Event::Write { master: master.clone(), address: 3 },
                &Event::Read { master: master.clone(), address: 1 },
                &Event::Read { master: master.clone(), address: 2 },
                &Event::Read { master: master.clone(), address: 3 },
            ]
        );
    }

    // Slaves come up before the first operation and go down after the last.
    let first_op = events
        .iter()
        .position(|e| matches!(e, Event::Write { .. }))
        .unwrap();
    let last_op = events
        .iter()
        .position(|e| matches!(e, Event::Read { address: 3, .. }))
        .unwrap();
    assert!(events[..first_op].iter().all(|e| matches!(e, Event::Spawn(_))));
    assert!(events[last_op + 1..last_op + 4]
        .iter()
        .all(|e| matches!(e, Event::Stop(_))));
}

#[tokio::test]
async fn test_rejected_writes_only_affect_their_permutation() {
    let bus = SharedBus::default();
    bus.lock()
        .reject_writes
        .insert(("/dev/ttyUSB0".to_string(), "/dev/ttyUSB2".to_string()));

    let outcome = MatrixDriver::new(engine(&bus))
        .run(&ports(4), &BaudSweep::new([9600]))
        .await;

    let first = &outcome.reports[0];
    let failed: Vec<_> = first
        .results_of(OperationKind::Write)
        .filter(|r| !r.success)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].port, "/dev/ttyUSB2");
    assert_eq!(failed[0].address, 2);
    assert!(failed[0]
        .diagnostic
        .as_deref()
        .unwrap()
        .contains("Illegal Data Address"));
    assert_eq!(count(first, OperationKind::Write, true), 2);

    for report in &outcome.reports[1..] {
        assert!(report.all_passed(), "{report:?}");
    }
    assert!(!outcome.summary.all_passed());
    assert_eq!(outcome.summary.total.writes_failed, 1);
}

#[tokio::test]
async fn test_read_mismatch_reports_actual_and_expected() {
    let bus = SharedBus::default();
    bus.lock()
        .reject_writes
        .insert(("/dev/ttyUSB1".to_string(), "/dev/ttyUSB0".to_string()));

    let reports = engine(&bus).run(&ports(2), 9600).await.unwrap();
    let read = reports[1]
        .results_of(OperationKind::Read)
        .next()
        .unwrap()
        .clone();
    assert!(!read.success);
    let diagnostic = read.diagnostic.unwrap();
    assert!(diagnostic.contains("Read: [0, 0, 0, 0, 0, 0, 0, 0, 0, 0]"));
    assert!(diagnostic.contains("Expected: [1, 2, 3, 4, 5, 6, 7, 8, 9, 10]"));
}

#[tokio::test]
async fn test_panic_mid_permutation_still_stops_every_slave() {
    let bus = SharedBus::default();
    bus.lock().panic_on_read_from = Some("/dev/ttyUSB1".to_string());
    let engine = engine(&bus);

    let result = AssertUnwindSafe(engine.run(&ports(4), 9600))
        .catch_unwind()
        .await;
    assert!(result.is_err());

    let bus = bus.lock();
    // Permutation 0 completed, permutation 1 panicked on its first read.
    assert_eq!(bus.spawned, 6);
    assert_eq!(bus.stopped, bus.spawned);
    assert!(bus.live.is_empty());
}

#[tokio::test]
async fn test_abort_stops_slaves_and_skips_remaining_operations() {
    let bus = SharedBus::default();
    let abort = AbortSignal::new();
    bus.lock().abort_on_write = Some((2, abort.clone()));
    let engine = engine_with(&bus, abort, Arc::new(ConsoleReporter));

    let err = engine.run(&ports(4), 9600).await.unwrap_err();
    let HarnessError::Aborted { reports } = err;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].results.len(), 2);
    assert_eq!(reports[0].results_of(OperationKind::Read).count(), 0);

    let bus = bus.lock();
    assert_eq!(bus.spawned, 3);
    assert_eq!(bus.stopped, 3);
    assert!(!bus.events.iter().any(|e| matches!(e, Event::Read { .. })));
}

#[tokio::test]
async fn test_abort_ends_the_sweep() {
    let bus = SharedBus::default();
    let abort = AbortSignal::new();
    // Fourth permutation at the first baud rate issues writes 10..12.
    bus.lock().abort_on_write = Some((11, abort.clone()));
    let driver = MatrixDriver::new(engine_with(&bus, abort, Arc::new(ConsoleReporter)));

    let outcome = driver.run(&ports(4), &BaudSweep::new([9600, 19200])).await;

    assert!(outcome.summary.aborted);
    assert!(!outcome.summary.all_passed());
    assert_eq!(outcome.reports.len(), 4);
    assert!(outcome.reports.iter().all(|r| r.baud_rate == 9600));
    let bus = bus.lock();
    assert_eq!(bus.stopped, bus.spawned);
}

#[tokio::test]
async fn test_unavailable_slave_is_recorded_without_retry() {
    let bus = SharedBus::default();
    bus.lock().unavailable.insert("/dev/ttyUSB3".to_string());

    let reports = engine(&bus).run(&ports(4), 9600).await.unwrap();

    let first = &reports[0];
    assert_eq!(first.spawn_failures.len(), 1);
    assert!(first.spawn_failures[0].contains("/dev/ttyUSB3"));
    // Address 3 still gets exactly one write and one read, both failing.
    let to_missing: Vec<_> = first.results.iter().filter(|r| r.address == 3).collect();
    assert_eq!(to_missing.len(), 2);
    assert!(to_missing.iter().all(|r| !r.success));
    assert_eq!(count(first, OperationKind::Write, true), 2);
    assert_eq!(count(first, OperationKind::Read, true), 2);

    let bus = bus.lock();
    assert_eq!(bus.spawned, 9);
    assert_eq!(bus.stopped, 9);
    let writes = bus
        .events
        .iter()
        .filter(|e| matches!(e, Event::Write { .. }))
        .count();
    assert_eq!(writes, 12);
}

#[tokio::test]
async fn test_sweep_runs_lowest_baud_first() {
    let bus = SharedBus::default();
    let outcome = MatrixDriver::new(engine(&bus))
        .run(&ports(3), &BaudSweep::new([19200, 9600]))
        .await;

    let bauds: Vec<u32> = outcome.reports.iter().map(|r| r.baud_rate).collect();
    assert_eq!(bauds, vec![9600, 9600, 9600, 19200, 19200, 19200]);
    assert_eq!(outcome.summary.per_baud.len(), 2);
    assert!(outcome.summary.all_passed());
}

#[derive(Default)]
struct PhaseRecorder(Mutex<Vec<(OperationKind, bool)>>);

impl Reporter for PhaseRecorder {
    fn phase_started(&self, kind: OperationKind) {
        self.0.lock().push((kind, true));
    }

    fn operation_finished(&self, result: &busprobe::core::OperationResult) {
        self.0.lock().push((result.kind, false));
    }
}

#[tokio::test]
async fn test_reporter_sees_three_write_results_before_read_phase() {
    let bus = SharedBus::default();
    let recorder = Arc::new(PhaseRecorder::default());
    let engine = engine_with(&bus, AbortSignal::new(), recorder.clone());

    let plan = busprobe::core::plan_permutations(&ports(4));
    engine.run_permutation(&plan[0], 9600).await.unwrap();

    use OperationKind::{Read, Write};
    assert_eq!(
        *recorder.0.lock(),
        vec![
            (Write, true),
            (Write, false),
            (Write, false),
            (Write, false),
            (Read, true),
            (Read, false),
            (Read, false),
            (Read, false),
        ]
    );
}
