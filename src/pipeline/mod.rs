//! One book, one run: a fetch task feeding a pool of translator workers
//! through a bounded queue, with every chapter transition persisted.

mod queue;
mod run;
mod stats;

pub use queue::{QueueConsumer, QueueProducer, QueuedChapter, Slot, chapter_queue};
pub use run::{
    ChapterUpdate, NoopObserver, PipelineRun, RunError, RunObserver, RunOutcome, RunRequest,
    RunStage, RunSummary,
};
pub use stats::{RunStats, RunStatsSnapshot, WorkerState};
