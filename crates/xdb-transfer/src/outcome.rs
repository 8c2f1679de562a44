//! Per-table outcomes and the aggregate run status shared by export and import.

use serde::{Deserialize, Serialize};

/// Overall run status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    /// Every table loaded, but some foreign keys could not be applied.
    SucceededWithDeferredConstraints,
    PartiallyFailed { failed: usize, total: usize },
    Aborted { reason: String },
    Cancelled,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::SucceededWithDeferredConstraints
        )
    }

    /// Aggregate status from per-table outcomes.
    pub fn summarize(tables: &[TableOutcome], unapplied_constraints: usize, cancelled: bool) -> Self {
        if cancelled {
            return RunStatus::Cancelled;
        }
        let failed = tables
            .iter()
            .filter(|t| t.status == TableStatus::Failed)
            .count();
        if failed > 0 {
            RunStatus::PartiallyFailed {
                failed,
                total: tables.len(),
            }
        } else if unapplied_constraints > 0 {
            RunStatus::SucceededWithDeferredConstraints
        } else {
            RunStatus::Succeeded
        }
    }

    pub fn label(&self) -> String {
        match self {
            RunStatus::Succeeded => "succeeded".into(),
            RunStatus::SucceededWithDeferredConstraints => {
                "succeeded with deferred constraints".into()
            }
            RunStatus::PartiallyFailed { failed, total } => {
                format!("partially failed ({} of {} tables)", failed, total)
            }
            RunStatus::Aborted { reason } => format!("aborted: {}", reason),
            RunStatus::Cancelled => "cancelled".into(),
        }
    }
}

/// Task status for one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Succeeded,
    Failed,
    /// Not processed because the run was cancelled or aborted first.
    Skipped,
}

/// What happened to one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableOutcome {
    /// Full table name (`schema.table`).
    pub table: String,
    pub status: TableStatus,
    /// Rows the source reported (export) or the manifest recorded (import).
    pub rows_attempted: u64,
    /// Rows written to files (export) or committed to the target (import).
    pub rows_succeeded: u64,
    /// Data files written or read.
    pub files: usize,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableOutcome {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            status: TableStatus::Skipped,
            rows_attempted: 0,
            rows_succeeded: 0,
            files: 0,
            duration_seconds: 0.0,
            error: None,
        }
    }

    pub fn failed(mut self, error: impl ToString) -> Self {
        self.status = TableStatus::Failed;
        self.error = Some(error.to_string());
        self
    }
}
