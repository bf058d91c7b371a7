//! Master/slave role rotation across a fixed set of ports at one baud rate.
//!
//! For every port in turn, that port becomes the master and every other port
//! runs a slave emulator with addresses `1..N` in port order. All writes of a
//! permutation are issued before any of its reads, so contention seen on the
//! bus can be attributed to a direction. Operations are never retried.
//!
//! Slave emulators spawned for a permutation are always stopped before the
//! permutation returns: after a normal run, after an operator abort, and
//! before a panic raised while exercising the bus is propagated.

use futures::FutureExt;
use std::{future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use crate::{
    core::{
        cleanup::AbortSignal,
        error::{HarnessError, ReadError, SpawnError},
        report::Reporter,
        types::{
            OperationKind, OperationResult, Parity, PermutationReport, ProtocolMode, RegisterSet,
            SlaveAssignment, SlaveConfiguration,
        },
    },
    protocol::{
        diagslave::{SlaveLauncher, SlaveProcess},
        modpoll::{MasterTarget, ModbusMaster, ReadRequest, WriteRequest},
        parse::verify,
    },
};

/// Immutable settings shared by every permutation of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationSettings {
    pub parity: Parity,
    pub mode: ProtocolMode,
    /// Written to every slave, then expected back from it.
    pub payload: RegisterSet,
    /// Response timeout handed to the master tool.
    pub timeout: Duration,
    /// Delay between spawning the slaves and the first master operation.
    pub settle: Duration,
    /// Bounded wait for each slave to exit when it is stopped.
    pub stop_grace: Duration,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            parity: Parity::None,
            mode: ProtocolMode::Rtu,
            payload: RegisterSet::canonical(500, 10),
            timeout: Duration::from_secs(10),
            settle: Duration::from_secs(1),
            stop_grace: Duration::from_secs(2),
        }
    }
}

/// One assignment of the master role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permutation {
    pub index: usize,
    pub master_port: String,
    pub slaves: Vec<SlaveAssignment>,
}

/// Enumerate the `N` role assignments for `N` ports.
pub fn plan_permutations(ports: &[String]) -> Vec<Permutation> {
    ports
        .iter()
        .enumerate()
        .map(|(index, master_port)| Permutation {
            index,
            master_port: master_port.clone(),
            slaves: ports
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, port)| port)
                .zip(1u8..)
                .map(|(port, address)| SlaveAssignment {
                    port: port.clone(),
                    address,
                })
                .collect(),
        })
        .collect()
}

/// Marker for an operator abort observed mid-permutation.
struct Interrupted;

pub struct RotationEngine {
    launcher: Arc<dyn SlaveLauncher>,
    master: Arc<dyn ModbusMaster>,
    reporter: Arc<dyn Reporter>,
    settings: RotationSettings,
    abort: AbortSignal,
}

impl RotationEngine {
    pub fn new(
        launcher: Arc<dyn SlaveLauncher>,
        master: Arc<dyn ModbusMaster>,
        reporter: Arc<dyn Reporter>,
        settings: RotationSettings,
        abort: AbortSignal,
    ) -> Self {
        Self {
            launcher,
            master,
            reporter,
            settings,
            abort,
        }
    }

    pub fn settings(&self) -> &RotationSettings {
        &self.settings
    }

    pub fn reporter(&self) -> &dyn Reporter {
        self.reporter.as_ref()
    }

    /// Run every permutation of `ports` at `baud_rate`, in port order.
    pub async fn run(
        &self,
        ports: &[String],
        baud_rate: u32,
    ) -> Result<Vec<PermutationReport>, HarnessError> {
        let mut reports = Vec::with_capacity(ports.len());
        for permutation in plan_permutations(ports) {
            match self.run_permutation(&permutation, baud_rate).await {
                Ok(report) => reports.push(report),
                Err(HarnessError::Aborted { reports: partial }) => {
                    reports.extend(partial);
                    return Err(HarnessError::Aborted { reports });
                }
            }
        }
        Ok(reports)
    }

    /// Spawn the slaves of one permutation, exercise the bus and stop the
    /// slaves again, whatever happened in between.
    pub async fn run_permutation(
        &self,
        permutation: &Permutation,
        baud_rate: u32,
    ) -> Result<PermutationReport, HarnessError> {
        self.reporter.permutation_started(permutation, baud_rate);
        log::info!(
            "Permutation {}: master {} with {} slave(s) at {baud_rate} baud",
            permutation.index + 1,
            permutation.master_port,
            permutation.slaves.len()
        );

        let mut report = PermutationReport::new(
            permutation.master_port.clone(),
            permutation.slaves.clone(),
            baud_rate,
        );
        let mut slaves: Vec<Box<dyn SlaveProcess>> = Vec::with_capacity(permutation.slaves.len());

        let exercised = AssertUnwindSafe(self.exercise(
            permutation,
            baud_rate,
            &mut slaves,
            &mut report,
        ))
        .catch_unwind()
        .await;

        self.release(&mut slaves).await;

        match exercised {
            Ok(Ok(())) => Ok(report),
            Ok(Err(Interrupted)) => {
                log::warn!(
                    "Permutation {} aborted by operator after {} operation(s)",
                    permutation.index + 1,
                    report.results.len()
                );
                Err(HarnessError::Aborted {
                    reports: vec![report],
                })
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn exercise(
        &self,
        permutation: &Permutation,
        baud_rate: u32,
        slaves: &mut Vec<Box<dyn SlaveProcess>>,
        report: &mut PermutationReport,
    ) -> Result<(), Interrupted> {
        for slave in &permutation.slaves {
            if self.abort.is_triggered() {
                return Err(Interrupted);
            }
            let config = SlaveConfiguration {
                port: slave.port.clone(),
                baud_rate,
                parity: self.settings.parity,
                mode: self.settings.mode,
                address: slave.address,
            };
            match self.launcher.start(&config) {
                Ok(handle) => slaves.push(handle),
                Err(err) => self.record_spawn_failure(report, err),
            }
        }

        self.interruptible(tokio::time::sleep(self.settings.settle))
            .await?;

        for handle in slaves.iter_mut() {
            if let Err(err) = handle.confirm_running() {
                self.record_spawn_failure(report, err);
            }
        }

        self.reporter.phase_started(OperationKind::Write);
        for slave in &permutation.slaves {
            let request = WriteRequest {
                target: self.target(&permutation.master_port, baud_rate, slave.address),
                registers: self.settings.payload.clone(),
            };
            let outcome = self.interruptible(self.master.write(&request)).await?;
            let result = match outcome {
                Ok(()) => OperationResult::passed(OperationKind::Write, slave),
                Err(err) => OperationResult::failed(OperationKind::Write, slave, err.to_string()),
            };
            self.record(report, result);
        }

        self.reporter.phase_started(OperationKind::Read);
        let expected = &self.settings.payload;
        for slave in &permutation.slaves {
            let request = ReadRequest {
                target: self.target(&permutation.master_port, baud_rate, slave.address),
                start: expected.start,
                count: expected.count(),
            };
            let outcome = self.interruptible(self.master.read(&request)).await?;
            let checked = outcome.and_then(|actual| {
                if verify(&actual, &expected.values) {
                    Ok(())
                } else {
                    Err(ReadError::Mismatch {
                        actual,
                        expected: expected.values.clone(),
                    })
                }
            });
            let result = match checked {
                Ok(()) => OperationResult::passed(OperationKind::Read, slave),
                Err(err) => OperationResult::failed(OperationKind::Read, slave, err.to_string()),
            };
            self.record(report, result);
        }

        Ok(())
    }

    /// Stop every slave of the permutation. Failures are logged; they never
    /// prevent the remaining slaves from being stopped.
    async fn release(&self, slaves: &mut Vec<Box<dyn SlaveProcess>>) {
        for mut handle in slaves.drain(..) {
            if let Err(err) = handle.stop(self.settings.stop_grace).await {
                log::warn!("{err}");
            }
        }
    }

    async fn interruptible<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        if self.abort.is_triggered() {
            return Err(Interrupted);
        }
        tokio::select! {
            biased;
            _ = self.abort.triggered() => Err(Interrupted),
            output = fut => Ok(output),
        }
    }

    fn target(&self, master_port: &str, baud_rate: u32, address: u8) -> MasterTarget {
        MasterTarget {
            port: master_port.to_string(),
            baud_rate,
            timeout: self.settings.timeout,
            parity: self.settings.parity,
            mode: self.settings.mode,
            address,
        }
    }

    fn record_spawn_failure(&self, report: &mut PermutationReport, err: SpawnError) {
        log::error!(
            "Slave on {} unavailable (master {}, {} baud): {err}",
            err.port(),
            report.master_port,
            report.baud_rate
        );
        self.reporter.spawn_failed(&err);
        report.spawn_failures.push(err.to_string());
    }

    fn record(&self, report: &mut PermutationReport, result: OperationResult) {
        match &result.diagnostic {
            None => log::info!(
                "{} to address {} on {} via master {} at {} baud passed",
                result.kind,
                result.address,
                result.port,
                report.master_port,
                report.baud_rate
            ),
            Some(diagnostic) => log::warn!(
                "{} to address {} on {} via master {} at {} baud failed: {diagnostic}",
                result.kind,
                result.address,
                result.port,
                report.master_port,
                report.baud_rate
            ),
        }
        self.reporter.operation_finished(&result);
        report.results.push(result);
    }
}
