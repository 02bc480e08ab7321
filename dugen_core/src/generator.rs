use crate::handle::{DeclaringType, PutRecord};
use crate::orchestrator::CancellationToken;
use crate::store::CoverageStore;
use crate::strategy::GenerationStrategy;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one or more per-type generation batches.
#[derive(Debug, Default)]
pub struct GenerationReport {
    /// Records emitted for the engine, grouped by type in the order generated.
    pub emitted: Vec<PutRecord>,
    /// Bodies that had already been generated for their type.
    pub skipped_duplicates: usize,
    /// Pairs for which the strategy failed.
    pub failures: usize,
    /// Set when cancellation stopped generation before every type was visited.
    pub cancelled: bool,
}

impl GenerationReport {
    fn merge(&mut self, other: GenerationReport) {
        self.emitted.extend(other.emitted);
        self.skipped_duplicates += other.skipped_duplicates;
        self.failures += other.failures;
        self.cancelled |= other.cancelled;
    }
}

/// Produces PUT records for the uncovered pairs held by a [`CoverageStore`].
///
/// Every emitted body is recorded in the store first, so a body is never
/// emitted twice for the same type, across calls and across cycles.
pub struct PutGenerator {
    store: Arc<CoverageStore>,
    strategy: Box<dyn GenerationStrategy>,
    threads: usize,
}

impl PutGenerator {
    pub fn new(store: Arc<CoverageStore>, strategy: Box<dyn GenerationStrategy>) -> Self {
        Self {
            store,
            strategy,
            threads: 1,
        }
    }

    /// Number of worker threads used by [`PutGenerator::generate_all`].
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Generates PUTs for the uncovered pairs of `ty`.
    ///
    /// A strategy failure only skips the pair it happened on.
    pub fn generate_for_type(&self, ty: &DeclaringType) -> GenerationReport {
        let mut report = GenerationReport::default();
        let pairs = self.store.uncovered_pairs_for(ty);
        if pairs.is_empty() {
            return report;
        }

        for pair in pairs {
            let body = match self.strategy.generate(&pair) {
                Ok(body) => body,
                Err(e) => {
                    warn!(
                        declaring_type = %ty,
                        pair = %pair,
                        strategy = self.strategy.name(),
                        error = %e,
                        "PUT generation failed, continuing with next pair"
                    );
                    report.failures += 1;
                    continue;
                }
            };

            if self.store.has_generated_put(ty, &body) || !self.store.record_put(ty, &body) {
                debug!(declaring_type = %ty, pair = %pair, "PUT already generated, skipping");
                report.skipped_duplicates += 1;
                continue;
            }

            debug!(declaring_type = %ty, pair = %pair, "Emitting PUT");
            report.emitted.push(PutRecord {
                declaring_type: ty.clone(),
                body,
                pair,
            });
        }
        report
    }

    /// Generates for each of `types`, checking `cancel` before each type.
    ///
    /// With more than one thread the types are split into contiguous chunks,
    /// one per worker; records still come out in the order of `types`.
    pub fn generate_all(
        &self,
        types: &[DeclaringType],
        cancel: &CancellationToken,
    ) -> GenerationReport {
        let report = if self.threads <= 1 || types.len() <= 1 {
            self.generate_sequential(types, cancel)
        } else {
            let chunk_size = types.len().div_ceil(self.threads);
            std::thread::scope(|scope| {
                let workers: Vec<_> = types
                    .chunks(chunk_size)
                    .map(|chunk| scope.spawn(move || self.generate_sequential(chunk, cancel)))
                    .collect();

                let mut merged = GenerationReport::default();
                for worker in workers {
                    match worker.join() {
                        Ok(part) => merged.merge(part),
                        Err(_) => {
                            warn!("PUT generation worker panicked, its types produced no PUTs");
                            merged.failures += 1;
                        }
                    }
                }
                merged
            })
        };

        if report.cancelled {
            info!(
                emitted = report.emitted.len(),
                "PUT generation cancelled before all types were visited"
            );
        }
        report
    }

    fn generate_sequential(
        &self,
        types: &[DeclaringType],
        cancel: &CancellationToken,
    ) -> GenerationReport {
        let mut report = GenerationReport::default();
        for ty in types {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.merge(self.generate_for_type(ty));
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{DuPair, FieldHandle, MethodHandle};
    use crate::strategy::{GenerationError, TemplateStrategy};

    fn pair(ty: &str, field: &str, def: &str, use_method: &str) -> DuPair {
        let ty = DeclaringType::from(ty);
        DuPair::new(
            FieldHandle::new(field, ty.clone()),
            MethodHandle::new(def, ty.clone()),
            MethodHandle::new(use_method, ty),
        )
        .unwrap()
    }

    /// Fails for any pair whose use method ends in "Broken".
    struct PickyStrategy;

    impl GenerationStrategy for PickyStrategy {
        fn name(&self) -> &'static str {
            "picky"
        }

        fn generate(&self, pair: &DuPair) -> Result<String, GenerationError> {
            if pair.use_method().name().ends_with("Broken") {
                return Err(GenerationError::Strategy {
                    strategy: "picky",
                    pair: pair.to_string(),
                    reason: "refusing".to_string(),
                });
            }
            Ok(format!("test {}", pair))
        }
    }

    fn template_generator(store: &Arc<CoverageStore>) -> PutGenerator {
        PutGenerator::new(Arc::clone(store), Box::new(TemplateStrategy::default()))
    }

    #[test]
    fn no_uncovered_pairs_is_a_noop() {
        let store = Arc::new(CoverageStore::new());
        let generator = template_generator(&store);
        let report = generator.generate_for_type(&"T".into());
        assert!(report.emitted.is_empty());
        assert!(store.types().is_empty());
    }

    #[test]
    fn second_pass_emits_nothing_new() {
        let store = Arc::new(CoverageStore::new());
        store.register(pair("T", "T.F", "T.Set", "T.Get"));
        store.register(pair("T", "T.F", "T.Reset", "T.Get"));
        let generator = template_generator(&store);
        let t = DeclaringType::from("T");

        let first = generator.generate_for_type(&t);
        assert_eq!(first.emitted.len(), 2);
        assert_ne!(first.emitted[0].dedup_key(), first.emitted[1].dedup_key());

        let second = generator.generate_for_type(&t);
        assert!(second.emitted.is_empty());
        assert_eq!(second.skipped_duplicates, 2);
        assert_eq!(store.puts_for(&t).len(), 2);
    }

    #[test]
    fn identical_bodies_within_one_pass_are_emitted_once() {
        let store = Arc::new(CoverageStore::new());
        store.register(pair("T", "T.F", "T.Set", "T.Get"));
        store.register(pair("T", "T.G", "T.Set", "T.Get"));
        let generator = PutGenerator::new(
            Arc::clone(&store),
            Box::new(TemplateStrategy::new("put for {type}").unwrap()),
        );
        let report = generator.generate_for_type(&"T".into());
        assert_eq!(report.emitted.len(), 1);
        assert_eq!(report.skipped_duplicates, 1);
    }

    #[test]
    fn strategy_failure_does_not_block_other_pairs() {
        let store = Arc::new(CoverageStore::new());
        store.register(pair("T", "T.F", "T.Set", "T.Broken"));
        store.register(pair("T", "T.F", "T.Set", "T.Get"));
        let generator = PutGenerator::new(Arc::clone(&store), Box::new(PickyStrategy));

        let report = generator.generate_for_type(&"T".into());
        assert_eq!(report.failures, 1);
        assert_eq!(report.emitted.len(), 1);
        assert_eq!(report.emitted[0].pair.use_method().name(), "T.Get");
    }

    #[test]
    fn generation_history_survives_coverage() {
        let store = Arc::new(CoverageStore::new());
        let p = pair("T", "T.F", "T.Set", "T.Get");
        store.register(p.clone());
        let generator = template_generator(&store);
        let t = DeclaringType::from("T");

        let report = generator.generate_for_type(&t);
        let body = report.emitted[0].body.clone();
        store.mark_covered(&p);

        assert!(store.uncovered_pairs_for(&t).is_empty());
        assert!(store.has_generated_put(&t, &body));
        assert!(generator.generate_for_type(&t).emitted.is_empty());
    }

    #[test]
    fn parallel_generation_keeps_type_order() {
        let store = Arc::new(CoverageStore::new());
        let types: Vec<DeclaringType> = (0..7)
            .map(|i| DeclaringType::new(format!("T{i}")))
            .collect();
        for ty in &types {
            let name = ty.as_str();
            let (field, def, use_method) = (
                format!("{name}.F"),
                format!("{name}.Set"),
                format!("{name}.Get"),
            );
            store.register(pair(name, &field, &def, &use_method));
        }
        let generator = template_generator(&store).with_threads(3);
        let report = generator.generate_all(&types, &CancellationToken::new());

        let emitted_types: Vec<DeclaringType> = report
            .emitted
            .iter()
            .map(|record| record.declaring_type.clone())
            .collect();
        assert_eq!(emitted_types, types);
        assert!(!report.cancelled);
    }

    #[test]
    fn cancelled_token_stops_before_first_type() {
        let store = Arc::new(CoverageStore::new());
        store.register(pair("T", "T.F", "T.Set", "T.Get"));
        let generator = template_generator(&store);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = generator.generate_all(&["T".into()], &cancel);
        assert!(report.cancelled);
        assert!(report.emitted.is_empty());
        assert!(store.puts_for(&"T".into()).is_empty());
    }
}
