//! Admit or reject decisions for the request path.
//!
//! Evaluation is pure and never performs I/O. Every rejection produces exactly
//! one outcome, admissions produce none.

use crate::cache::Decision;
use crate::metrics_defs::ADMISSION_REJECTED;
use crate::types::{ProjectConfig, ProjectKey};
use serde::Serialize;
use shared::counter;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Numeric category of an outcome record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(into = "u8")]
pub enum OutcomeCategory {
    Accepted = 0,
    Filtered = 1,
    RateLimited = 2,
    Invalid = 3,
}

impl From<OutcomeCategory> for u8 {
    fn from(category: OutcomeCategory) -> Self {
        category as u8
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// The project exists but is disabled.
    ProjectDisabled,
    /// The upstream does not know the project.
    ProjectNotFound,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::ProjectDisabled => "project_id",
            RejectReason::ProjectNotFound => "project not found",
        }
    }

    pub fn category(&self) -> OutcomeCategory {
        OutcomeCategory::Invalid
    }
}

/// Record emitted for every rejected item.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Outcome {
    pub project_key: ProjectKey,
    pub category: OutcomeCategory,
    pub reason: &'static str,
}

impl Outcome {
    pub fn new(project_key: ProjectKey, reason: RejectReason) -> Self {
        Outcome {
            project_key,
            category: reason.category(),
            reason: reason.as_str(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Admission {
    /// The config is usable and the project is enabled.
    Admitted(Arc<ProjectConfig>),
    /// Nothing is known about the project yet. A fetch has been scheduled.
    AdmittedOptimistically,
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected(_))
    }
}

/// Maps a cache decision to an admission.
pub fn evaluate(decision: &Decision) -> Admission {
    match decision {
        Decision::UseFresh(config) | Decision::UseStale(config) => {
            if config.disabled() {
                Admission::Rejected(RejectReason::ProjectDisabled)
            } else {
                Admission::Admitted(config.clone())
            }
        }
        Decision::NotFound => Admission::Rejected(RejectReason::ProjectNotFound),
        Decision::Unknown => Admission::AdmittedOptimistically,
    }
}

/// Receives the outcome of every rejected item.
pub trait OutcomeSink: Send + Sync {
    fn emit(&self, outcome: Outcome);
}

/// Logs outcomes and counts them by reason.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingOutcomeSink;

impl OutcomeSink for TracingOutcomeSink {
    fn emit(&self, outcome: Outcome) {
        tracing::debug!(
            project_key = %outcome.project_key,
            category = outcome.category as u8,
            reason = outcome.reason,
            "rejected item"
        );
        counter!(ADMISSION_REJECTED, "reason" => outcome.reason).increment(1);
    }
}

/// Forwards outcomes into a channel.
#[derive(Clone, Debug)]
pub struct ChannelOutcomeSink {
    tx: mpsc::UnboundedSender<Outcome>,
}

impl ChannelOutcomeSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelOutcomeSink { tx }, rx)
    }
}

impl OutcomeSink for ChannelOutcomeSink {
    fn emit(&self, outcome: Outcome) {
        if self.tx.send(outcome).is_err() {
            tracing::debug!("outcome receiver dropped");
        }
    }
}

/// Evaluates decisions and reports rejections to a sink.
#[derive(Clone)]
pub struct AdmissionEvaluator {
    sink: Arc<dyn OutcomeSink>,
}

impl AdmissionEvaluator {
    pub fn new(sink: Arc<dyn OutcomeSink>) -> Self {
        AdmissionEvaluator { sink }
    }

    pub fn evaluate(&self, key: &ProjectKey, decision: &Decision) -> Admission {
        let admission = evaluate(decision);
        if let Admission::Rejected(reason) = admission {
            self.sink.emit(Outcome::new(key.clone(), reason));
        }
        admission
    }
}

impl Default for AdmissionEvaluator {
    fn default() -> Self {
        Self::new(Arc::new(TracingOutcomeSink))
    }
}
