//! Baud-rate sweep over the rotation engine, plus the end-of-run tally.
use serde::Serialize;
use std::{collections::BTreeMap, fmt};

use crate::core::{
    error::HarnessError,
    rotation::RotationEngine,
    types::{OperationKind, PermutationReport},
};

/// Ascending, duplicate-free list of baud rates.
///
/// Lower rates tolerate more bus imperfection, so a sweep starts there and
/// works up to the rates that expose reflection and termination problems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaudSweep(Vec<u32>);

impl BaudSweep {
    pub fn new(rates: impl IntoIterator<Item = u32>) -> Self {
        let mut rates: Vec<u32> = rates.into_iter().collect();
        rates.sort_unstable();
        rates.dedup();
        Self(rates)
    }

    pub fn rates(&self) -> &[u32] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub permutations: usize,
    pub writes_passed: usize,
    pub writes_failed: usize,
    pub reads_passed: usize,
    pub reads_failed: usize,
    pub spawn_failures: usize,
}

impl Tally {
    fn add(&mut self, report: &PermutationReport) {
        self.permutations += 1;
        self.spawn_failures += report.spawn_failures.len();
        for result in &report.results {
            match (result.kind, result.success) {
                (OperationKind::Write, true) => self.writes_passed += 1,
                (OperationKind::Write, false) => self.writes_failed += 1,
                (OperationKind::Read, true) => self.reads_passed += 1,
                (OperationKind::Read, false) => self.reads_failed += 1,
            }
        }
    }

    pub fn failures(&self) -> usize {
        self.writes_failed + self.reads_failed + self.spawn_failures
    }
}

/// Aggregate pass/fail counts of a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub per_baud: BTreeMap<u32, Tally>,
    pub total: Tally,
    pub aborted: bool,
}

impl RunSummary {
    pub fn from_reports(reports: &[PermutationReport], aborted: bool) -> Self {
        let mut summary = Self {
            aborted,
            ..Self::default()
        };
        for report in reports {
            summary.per_baud.entry(report.baud_rate).or_default().add(report);
            summary.total.add(report);
        }
        summary
    }

    /// True when the run completed and every operation passed.
    pub fn all_passed(&self) -> bool {
        !self.aborted && self.total.permutations > 0 && self.total.failures() == 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Summary{}:", if self.aborted { " (aborted)" } else { "" })?;
        writeln!(
            f,
            "  {:>8}  {:>5}  {:>11}  {:>11}  {:>6}",
            "baud", "perms", "writes ok/x", "reads ok/x", "spawn!"
        )?;
        for (baud, t) in &self.per_baud {
            writeln!(
                f,
                "  {:>8}  {:>5}  {:>5}/{:<5}  {:>5}/{:<5}  {:>6}",
                baud,
                t.permutations,
                t.writes_passed,
                t.writes_failed,
                t.reads_passed,
                t.reads_failed,
                t.spawn_failures
            )?;
        }
        let t = &self.total;
        write!(
            f,
            "  {:>8}  {:>5}  {:>5}/{:<5}  {:>5}/{:<5}  {:>6}",
            "total",
            t.permutations,
            t.writes_passed,
            t.writes_failed,
            t.reads_passed,
            t.reads_failed,
            t.spawn_failures
        )
    }
}

/// Everything a finished (or aborted) sweep produced.
#[derive(Debug, Clone)]
pub struct MatrixOutcome {
    pub reports: Vec<PermutationReport>,
    pub summary: RunSummary,
}

pub struct MatrixDriver {
    engine: RotationEngine,
}

impl MatrixDriver {
    pub fn new(engine: RotationEngine) -> Self {
        Self { engine }
    }

    /// Run one full rotation per baud rate, lowest rate first. Failures are
    /// recorded and the sweep moves on; only an operator abort ends it early.
    pub async fn run(&self, ports: &[String], sweep: &BaudSweep) -> MatrixOutcome {
        let mut reports = Vec::with_capacity(ports.len() * sweep.rates().len());
        let mut aborted = false;

        for &baud_rate in sweep.rates() {
            log::info!(
                "Rotating roles across {} ports at {baud_rate} baud",
                ports.len()
            );
            match self.engine.run(ports, baud_rate).await {
                Ok(done) => reports.extend(done),
                Err(HarnessError::Aborted { reports: done }) => {
                    reports.extend(done);
                    aborted = true;
                    log::warn!("Sweep aborted at {baud_rate} baud");
                    break;
                }
            }
        }

        let summary = RunSummary::from_reports(&reports, aborted);
        self.engine.reporter().run_finished(&summary);
        MatrixOutcome { reports, summary }
    }
}
