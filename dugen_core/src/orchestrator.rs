use crate::engine::{CoverageReport, EngineError, TestEngine};
use crate::extractor::{DuPairExtractor, RejectionReason};
use crate::generator::PutGenerator;
use crate::handle::{CoverageStatus, DeclaringType, PutRecord};
use crate::metadata::{CandidateSource, MetadataViews};
use crate::put_files::PutFileWriter;
use crate::store::{CoverageStore, SnapshotFormat, StoreSummary};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Cooperative stop signal shared between the orchestrator and its caller.
///
/// Checked between cycles and before each per-type generation batch.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Extracting,
    Generating,
    AwaitingResults,
    Terminated,
}

impl OrchestratorState {
    /// Whether the state machine has an edge from `self` to `next`.
    pub fn can_transition_to(self, next: OrchestratorState) -> bool {
        use OrchestratorState::*;
        matches!(
            (self, next),
            (Idle, Extracting)
                | (Idle, Terminated)
                | (Extracting, Generating)
                | (Generating, AwaitingResults)
                | (AwaitingResults, Idle)
                | (AwaitingResults, Terminated)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    CycleBudgetExhausted,
    /// A cycle had no new PUTs and nothing left over from a failed engine run.
    Fixpoint,
    EngineRetriesExhausted,
    Cancelled,
}

/// What happened when the batch was handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutcome {
    /// The batch was empty; the engine was not invoked.
    Skipped,
    Reported { covered: usize, observed: usize },
    /// The engine failed or timed out; the cycle counts as zero coverage.
    Unavailable(EngineError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub cycle: usize,
    pub candidates: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub new_pairs: usize,
    pub puts_emitted: usize,
    /// PUTs from an earlier cycle whose engine run failed, sent again.
    pub puts_resent: usize,
    pub puts_skipped: usize,
    /// PUT files that could not be written this cycle; retried next cycle.
    pub put_write_failures: usize,
    pub generation_failures: usize,
    pub newly_covered: usize,
    /// Triples from the coverage report that did not form a valid pair.
    pub report_rejected: usize,
    pub engine: EngineOutcome,
}

impl CycleSummary {
    fn new(cycle: usize) -> Self {
        Self {
            cycle,
            candidates: 0,
            accepted: 0,
            rejected: 0,
            new_pairs: 0,
            puts_emitted: 0,
            puts_resent: 0,
            puts_skipped: 0,
            put_write_failures: 0,
            generation_failures: 0,
            newly_covered: 0,
            report_rejected: 0,
            engine: EngineOutcome::Skipped,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub reason: TerminationReason,
    pub cycles: Vec<CycleSummary>,
    pub store: StoreSummary,
}

impl RunSummary {
    pub fn cycles_run(&self) -> usize {
        self.cycles.len()
    }

    pub fn total_puts_emitted(&self) -> usize {
        self.cycles.iter().map(|c| c.puts_emitted).sum()
    }

    pub fn total_newly_covered(&self) -> usize {
        self.cycles.iter().map(|c| c.newly_covered).sum()
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_cycles: usize,
    /// Consecutive engine failures after which the run stops.
    pub max_engine_failures: usize,
    pub engine_timeout: Duration,
    /// Types to extract candidates for; empty means every known type.
    pub types_of_interest: Vec<DeclaringType>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_cycles: 10,
            max_engine_failures: 3,
            engine_timeout: Duration::from_secs(30),
            types_of_interest: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct IngestCounts {
    new_pairs: usize,
    newly_covered: usize,
    rejected: usize,
}

/// Drives extract, generate, run-externally, ingest cycles until a
/// termination condition holds.
pub struct CycleOrchestrator {
    store: Arc<CoverageStore>,
    metadata: MetadataViews,
    generator: PutGenerator,
    engine: Box<dyn TestEngine>,
    put_writer: Option<PutFileWriter>,
    persistence: Option<(PathBuf, SnapshotFormat)>,
    settings: OrchestratorSettings,
    state: OrchestratorState,
    history: Vec<OrchestratorState>,
    termination: Option<TerminationReason>,
    cycles_run: usize,
    consecutive_engine_failures: usize,
    /// Batch of the last failed engine run.
    undelivered: Vec<PutRecord>,
    unwritten: Vec<PutRecord>,
}

impl CycleOrchestrator {
    pub fn new(
        store: Arc<CoverageStore>,
        metadata: MetadataViews,
        generator: PutGenerator,
        engine: Box<dyn TestEngine>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            metadata,
            generator,
            engine,
            put_writer: None,
            persistence: None,
            settings,
            state: OrchestratorState::Idle,
            history: vec![OrchestratorState::Idle],
            termination: None,
            cycles_run: 0,
            consecutive_engine_failures: 0,
            undelivered: Vec::new(),
            unwritten: Vec::new(),
        }
    }

    /// Also write every emitted PUT to disk.
    pub fn with_put_writer(mut self, writer: PutFileWriter) -> Self {
        self.put_writer = Some(writer);
        self
    }

    /// Save a store snapshot to `path` after every cycle.
    pub fn with_persistence(mut self, path: impl Into<PathBuf>, format: SnapshotFormat) -> Self {
        self.persistence = Some((path.into(), format));
        self
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn history(&self) -> &[OrchestratorState] {
        &self.history
    }

    pub fn store(&self) -> &Arc<CoverageStore> {
        &self.store
    }

    pub fn metadata(&self) -> &MetadataViews {
        &self.metadata
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    /// Runs cycles until termination.
    ///
    /// Once terminated the orchestrator stays terminated; a later call returns
    /// immediately with no cycles.
    pub fn run(&mut self, cancel: &CancellationToken) -> RunSummary {
        let mut cycles = Vec::new();

        let reason = loop {
            if let Some(reason) = self.termination {
                break reason;
            }
            if cancel.is_cancelled() {
                info!(cycles = self.cycles_run, "Cancellation requested, stopping");
                self.terminate(TerminationReason::Cancelled);
                continue;
            }
            if self.cycles_run >= self.settings.max_cycles {
                self.terminate(TerminationReason::CycleBudgetExhausted);
                continue;
            }
            cycles.push(self.run_cycle(cancel));
        };

        let store = self.store.summary();
        info!(
            ?reason,
            cycles = cycles.len(),
            pairs = store.total_pairs(),
            covered = store.total_covered(),
            puts = store.total_puts(),
            "Run finished"
        );
        RunSummary {
            reason,
            cycles,
            store,
        }
    }

    /// Runs a single cycle from `Idle`, ending in `Idle` or `Terminated`.
    fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleSummary {
        self.cycles_run += 1;
        let cycle = self.cycles_run;
        let mut summary = CycleSummary::new(cycle);
        info!(cycle, "Starting cycle");

        self.transition(OrchestratorState::Extracting);
        self.extract_candidates(&mut summary);

        self.transition(OrchestratorState::Generating);
        let pending_types = self.store.types_with_uncovered();
        let generation = self.generator.generate_all(&pending_types, cancel);
        summary.puts_emitted = generation.emitted.len();
        summary.puts_skipped = generation.skipped_duplicates;
        summary.generation_failures = generation.failures;
        summary.put_write_failures = self.write_put_files(cycle, &generation.emitted);

        // Bodies are recorded as generated before the engine sees them, so a
        // failed batch is only reachable from here.
        let mut batch = self.take_undelivered();
        summary.puts_resent = batch.len();
        batch.extend(generation.emitted.iter().cloned());

        self.transition(OrchestratorState::AwaitingResults);
        if !batch.is_empty() {
            summary.engine = match self.engine.run(&batch, self.settings.engine_timeout) {
                Ok(report) => {
                    self.consecutive_engine_failures = 0;
                    let outcome = EngineOutcome::Reported {
                        covered: report.covered.len(),
                        observed: report.observed.len(),
                    };
                    let counts = self.ingest(&report);
                    summary.new_pairs += counts.new_pairs;
                    summary.newly_covered = counts.newly_covered;
                    summary.report_rejected = counts.rejected;
                    outcome
                }
                Err(e) => {
                    self.consecutive_engine_failures += 1;
                    warn!(
                        cycle,
                        engine = self.engine.name(),
                        error = %e,
                        failures = self.consecutive_engine_failures,
                        puts = batch.len(),
                        "Engine unavailable, batch kept for the next cycle"
                    );
                    self.undelivered = batch.clone();
                    EngineOutcome::Unavailable(e)
                }
            };
        }
        self.persist(cycle);

        info!(
            cycle,
            candidates = summary.candidates,
            accepted = summary.accepted,
            rejected = summary.rejected,
            puts = summary.puts_emitted,
            resent = summary.puts_resent,
            newly_covered = summary.newly_covered,
            "Cycle complete"
        );

        let verdict = if generation.cancelled || cancel.is_cancelled() {
            Some(TerminationReason::Cancelled)
        } else if batch.is_empty() {
            Some(TerminationReason::Fixpoint)
        } else if self.settings.max_engine_failures > 0
            && self.consecutive_engine_failures >= self.settings.max_engine_failures
        {
            Some(TerminationReason::EngineRetriesExhausted)
        } else if self.cycles_run >= self.settings.max_cycles {
            Some(TerminationReason::CycleBudgetExhausted)
        } else {
            None
        };
        match verdict {
            Some(reason) => self.terminate(reason),
            None => self.transition(OrchestratorState::Idle),
        }
        summary
    }

    /// Drops undelivered records whose pair got covered in the meantime.
    fn take_undelivered(&mut self) -> Vec<PutRecord> {
        let mut pending = std::mem::take(&mut self.undelivered);
        pending.retain(|record| {
            self.store.status_of(&record.pair) != Some(CoverageStatus::Covered)
        });
        pending
    }

    /// Writes this cycle's PUTs plus any that failed to write before.
    /// Returns how many failed this time.
    fn write_put_files(&mut self, cycle: usize, emitted: &[PutRecord]) -> usize {
        let Some(writer) = &self.put_writer else {
            return 0;
        };
        let mut records = std::mem::take(&mut self.unwritten);
        records.extend(emitted.iter().cloned());
        let outcome = writer.write_all(&records);
        debug!(
            cycle,
            written = outcome.written,
            failed = outcome.failed.len(),
            "Wrote PUT files"
        );
        self.unwritten = outcome
            .failed
            .iter()
            .map(|(index, _)| records[*index].clone())
            .collect();
        outcome.failed.len()
    }

    fn types_of_interest(&self) -> Vec<DeclaringType> {
        let mut types = if self.settings.types_of_interest.is_empty() {
            self.metadata.known_types()
        } else {
            self.settings.types_of_interest.clone()
        };
        types.sort();
        types.dedup();
        types
    }

    fn extract_candidates(&self, summary: &mut CycleSummary) {
        let types = self.types_of_interest();
        let candidates = self.metadata.candidates(&types);
        let extractor = DuPairExtractor::new(&self.metadata);
        summary.candidates = candidates.len();

        for candidate in &candidates {
            match extractor.extract_candidate(candidate) {
                Ok(pair) => {
                    summary.accepted += 1;
                    if self.store.register(pair) {
                        summary.new_pairs += 1;
                    }
                }
                Err(RejectionReason::UnresolvedType(e)) => {
                    summary.rejected += 1;
                    warn!(candidate = %candidate, error = %e, "Skipping unresolved candidate");
                }
                Err(reason @ RejectionReason::TypeMismatch(_)) => {
                    summary.rejected += 1;
                    debug!(candidate = %candidate, %reason, "Rejected candidate");
                }
            }
        }
    }

    /// Applies a coverage report: observed entities first, then covered triples.
    fn ingest(&self, report: &CoverageReport) -> IngestCounts {
        let mut counts = IngestCounts::default();
        let dynamic_view = self.metadata.dynamic_view();
        for entity in &report.observed {
            if dynamic_view.observe(entity) {
                debug!(
                    entity = %entity.name,
                    declaring_type = %entity.declaring_type,
                    "Recorded observed entity"
                );
            }
        }

        let extractor = DuPairExtractor::new(&self.metadata);
        for triple in &report.covered {
            match extractor.extract_candidate(triple) {
                Ok(pair) => {
                    if self.store.register(pair.clone()) {
                        counts.new_pairs += 1;
                    }
                    if self.store.mark_covered(&pair) {
                        counts.newly_covered += 1;
                        debug!(pair = %pair, "Pair covered");
                    }
                }
                Err(reason) => {
                    counts.rejected += 1;
                    warn!(triple = %triple, %reason, "Ignoring covered triple");
                }
            }
        }
        counts
    }

    fn persist(&self, cycle: usize) {
        let Some((path, format)) = &self.persistence else {
            return;
        };
        match self.store.save_to_path(path, *format) {
            Ok(()) => debug!(cycle, path = ?path, "Saved store snapshot"),
            Err(e) => error!(cycle, path = ?path, error = %e, "Failed to save store snapshot"),
        }
    }

    fn transition(&mut self, next: OrchestratorState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(from = ?self.state, to = ?next, "State transition");
        self.state = next;
        self.history.push(next);
    }

    fn terminate(&mut self, reason: TerminationReason) {
        info!(?reason, "Terminating");
        self.transition(OrchestratorState::Terminated);
        self.termination = Some(reason);
    }
}
