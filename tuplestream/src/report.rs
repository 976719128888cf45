use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

/// Resumen de una ejecución.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub num_reducers: usize,

    /// -------- Contadores --------
    pub records_read: u64,
    /// Tuplas que algún filtro dejó afuera (incluye las de predicado fallido).
    pub filtered_out: u64,
    /// Predicados que fallaron y se trataron como `false`.
    pub filter_errors: u64,
    /// Registros o grupos descartados por `RecordErrorPolicy::DropAndLog`.
    pub dropped_records: u64,
    pub groups: u64,
    /// Filas de reducer descartadas por aridad incorrecta.
    pub rejected_rows: u64,
    pub records_written: u64,
    pub spilled_runs: u64,

    /// Mensaje del primer error, si falló.
    pub error: Option<String>,
}

impl RunReport {
    pub(crate) fn started(run_id: Uuid, num_reducers: usize) -> Self {
        Self {
            run_id,
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            num_reducers,
            records_read: 0,
            filtered_out: 0,
            filter_errors: 0,
            dropped_records: 0,
            groups: 0,
            rejected_rows: 0,
            records_written: 0,
            spilled_runs: 0,
            error: None,
        }
    }

    pub(crate) fn finish(&mut self, counters: &RunCounters, error: Option<String>) {
        counters.fill(self);
        self.finished_at = Some(Utc::now());
        self.status = if error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        self.error = error;
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Duración en milisegundos, si terminó.
    pub fn elapsed_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

/// Contadores compartidos entre todas las tareas de una ejecución.
#[derive(Debug, Default)]
pub(crate) struct RunCounters {
    pub records_read: AtomicU64,
    pub filtered_out: AtomicU64,
    pub filter_errors: AtomicU64,
    pub dropped_records: AtomicU64,
    pub groups: AtomicU64,
    pub rejected_rows: AtomicU64,
    pub records_written: AtomicU64,
    pub spilled_runs: AtomicU64,
}

impl RunCounters {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn fill(&self, report: &mut RunReport) {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        report.records_read = get(&self.records_read);
        report.filtered_out = get(&self.filtered_out);
        report.filter_errors = get(&self.filter_errors);
        report.dropped_records = get(&self.dropped_records);
        report.groups = get(&self.groups);
        report.rejected_rows = get(&self.rejected_rows);
        report.records_written = get(&self.records_written);
        report.spilled_runs = get(&self.spilled_runs);
    }
}
