pub mod config;
pub mod engine;
pub mod extractor;
pub mod generator;
pub mod handle;
pub mod metadata;
pub mod orchestrator;
pub mod put_files;
pub mod store;
pub mod strategy;

pub use config::DugenConfig;
pub use engine::{CommandEngine, CoverageReport, EngineError, InProcessEngine, TestEngine};
pub use extractor::{DuPairExtractor, RejectionReason};
pub use generator::{GenerationReport, PutGenerator};
pub use handle::{
    Candidate, CoverageStatus, DeclaringType, DuPair, FieldHandle, MethodHandle, PutRecord,
};
pub use metadata::{
    CandidateSource, EntityRef, InMemoryMetadata, MetadataDatabase, MetadataError, MetadataView,
    MetadataViews, ObservedEntity, ViewPolicy,
};
pub use orchestrator::{
    CancellationToken, CycleOrchestrator, CycleSummary, OrchestratorSettings, OrchestratorState,
    RunSummary, TerminationReason,
};
pub use put_files::{PutFileError, PutFileWriter, WriteSummary};
pub use store::{CoverageStore, SnapshotFormat, StoreError, StoreSnapshot, StoreSummary};
pub use strategy::{GenerationError, GenerationStrategy, SeededTemplateStrategy, TemplateStrategy};
