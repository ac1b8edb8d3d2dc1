use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The fixed six-step pipeline sequence. Strictly forward; skipping is only
/// possible through explicit resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageName {
    Validation,
    ImageAnalysis,
    NotesAnalysis,
    Combination,
    Structuring,
    SpecializedAnalysis,
}

impl StageName {
    pub const ORDERED: [StageName; 6] = [
        StageName::Validation,
        StageName::ImageAnalysis,
        StageName::NotesAnalysis,
        StageName::Combination,
        StageName::Structuring,
        StageName::SpecializedAnalysis,
    ];

    pub fn index(self) -> usize {
        Self::ORDERED
            .iter()
            .position(|s| *s == self)
            .expect("stage is part of the ordered sequence")
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Validation => "validation",
            StageName::ImageAnalysis => "imageAnalysis",
            StageName::NotesAnalysis => "notesAnalysis",
            StageName::Combination => "combination",
            StageName::Structuring => "structuring",
            StageName::SpecializedAnalysis => "specializedAnalysis",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// Per-stage bookkeeping: attempt count, timings, last failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl StageRecord {
    /// Attempts beyond the first, i.e. how often the stage was retried.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Per-invocation record of stage progress, warnings, and errors.
/// Owned by exactly one run; dropped when the run ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLedger {
    pub processing_id: Uuid,
    stages: HashMap<StageName, StageRecord>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl RunLedger {
    pub fn new(processing_id: Uuid) -> Self {
        let stages = StageName::ORDERED
            .iter()
            .map(|s| (*s, StageRecord::default()))
            .collect();
        Self {
            processing_id,
            stages,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn stage(&self, stage: StageName) -> &StageRecord {
        self.stages
            .get(&stage)
            .expect("ledger is initialized with every stage")
    }

    fn stage_mut(&mut self, stage: StageName) -> &mut StageRecord {
        self.stages
            .get_mut(&stage)
            .expect("ledger is initialized with every stage")
    }

    pub fn stage_started(&mut self, stage: StageName) {
        let record = self.stage_mut(stage);
        record.status = StageStatus::Running;
        if record.started_at.is_none() {
            record.started_at = Some(Utc::now());
        }
    }

    /// Record one attempt against a stage. `error` is `None` for the
    /// attempt that succeeded.
    pub fn record_attempt(&mut self, stage: StageName, error: Option<&str>) {
        let record = self.stage_mut(stage);
        record.attempts += 1;
        if let Some(e) = error {
            record.last_error = Some(e.to_string());
        }
    }

    pub fn stage_completed(&mut self, stage: StageName) {
        let record = self.stage_mut(stage);
        record.status = StageStatus::Completed;
        record.completed_at = Some(Utc::now());
    }

    pub fn stage_failed(&mut self, stage: StageName, error: &str) {
        let record = self.stage_mut(stage);
        record.status = StageStatus::Failed;
        record.completed_at = Some(Utc::now());
        record.last_error = Some(error.to_string());
        self.errors.push(format!("{stage}: {error}"));
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Completed stages in pipeline order.
    pub fn completed_stages(&self) -> Vec<StageName> {
        StageName::ORDERED
            .iter()
            .copied()
            .filter(|s| self.stage(*s).status == StageStatus::Completed)
            .collect()
    }

    /// The furthest stage that completed, used to resume the fallback pass.
    pub fn last_completed_stage(&self) -> Option<StageName> {
        self.completed_stages().into_iter().last()
    }

    pub fn all_stages_completed(&self) -> bool {
        self.completed_stages().len() == StageName::ORDERED.len()
    }
}

/// Shared registry of in-flight run ledgers, keyed by processing id.
/// Safe for concurrent runs; each ledger is only mutated by its own run.
#[derive(Default)]
pub struct RunLedgerStore {
    inner: Mutex<HashMap<Uuid, Arc<Mutex<RunLedger>>>>,
}

impl RunLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the ledger for a run, creating it on first access so the
    /// primary pass and its fallback share one record.
    pub fn open(&self, processing_id: Uuid) -> Arc<Mutex<RunLedger>> {
        let mut inner = self.inner.lock().expect("ledger store poisoned");
        inner
            .entry(processing_id)
            .or_insert_with(|| Arc::new(Mutex::new(RunLedger::new(processing_id))))
            .clone()
    }

    pub fn get(&self, processing_id: Uuid) -> Option<Arc<Mutex<RunLedger>>> {
        self.inner
            .lock()
            .expect("ledger store poisoned")
            .get(&processing_id)
            .cloned()
    }

    /// Drop a finished run's ledger.
    pub fn remove(&self, processing_id: Uuid) {
        self.inner
            .lock()
            .expect("ledger store poisoned")
            .remove(&processing_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("ledger store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
