use serde::Serialize;

/// What one translator worker is busy with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerState {
    pub worker: usize,
    pub chapter: Option<u32>,
}

/// Live counters of one run. Only mutated through the run's serialized update path.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    total: usize,
    to_fetch: usize,
    to_translate: usize,
    skipped: usize,
    fetched: usize,
    translated: usize,
    fetch_errors: usize,
    translate_errors: usize,
    error_messages: Vec<String>,
    fetching: Option<u32>,
    workers: Vec<Option<u32>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStatsSnapshot {
    pub total: usize,
    pub to_fetch: usize,
    pub to_translate: usize,
    pub skipped: usize,
    pub fetched: usize,
    pub translated: usize,
    pub fetch_errors: usize,
    pub translate_errors: usize,
    pub errors: usize,
    pub fetching: Option<u32>,
    pub workers: Vec<WorkerState>,
    pub glossary_size: usize,
    pub elapsed_ms: u64,
}

impl RunStats {
    pub fn new(
        total: usize,
        to_fetch: usize,
        to_translate: usize,
        skipped: usize,
        workers: usize,
    ) -> Self {
        Self {
            total,
            to_fetch,
            to_translate,
            skipped,
            workers: vec![None; workers],
            ..Self::default()
        }
    }

    pub fn set_fetching(&mut self, chapter: Option<u32>) {
        self.fetching = chapter;
    }

    pub fn set_worker(&mut self, worker: usize, chapter: Option<u32>) {
        if let Some(slot) = self.workers.get_mut(worker) {
            *slot = chapter;
        }
    }

    pub fn record_fetched(&mut self) {
        self.fetched += 1;
    }

    pub fn record_translated(&mut self) {
        self.translated += 1;
    }

    pub fn record_fetch_error(&mut self, index: u32, message: &str) {
        self.fetch_errors += 1;
        self.error_messages
            .push(format!("chapter {index}: fetch: {message}"));
    }

    pub fn record_translate_error(&mut self, index: u32, message: &str) {
        self.translate_errors += 1;
        self.error_messages
            .push(format!("chapter {index}: translate: {message}"));
    }

    pub fn error_messages(&self) -> &[String] {
        &self.error_messages
    }

    pub fn snapshot(&self, glossary_size: usize, elapsed_ms: u64) -> RunStatsSnapshot {
        RunStatsSnapshot {
            total: self.total,
            to_fetch: self.to_fetch,
            to_translate: self.to_translate,
            skipped: self.skipped,
            fetched: self.fetched,
            translated: self.translated,
            fetch_errors: self.fetch_errors,
            translate_errors: self.translate_errors,
            errors: self.fetch_errors + self.translate_errors,
            fetching: self.fetching,
            workers: self
                .workers
                .iter()
                .enumerate()
                .map(|(worker, chapter)| WorkerState {
                    worker,
                    chapter: *chapter,
                })
                .collect(),
            glossary_size,
            elapsed_ms,
        }
    }
}
