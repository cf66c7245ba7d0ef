use super::restore::{RestoreOptions, RestoreReport, RestoreScope};
use super::{BackupError, BackupType, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Legal edges of the job state machine.
    ///
    /// `Paused` is entered only from `Running` and resumes only to `Running`;
    /// a paused job may still be cancelled or time out.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
                | (Paused, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(BackupError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Backup,
    Restore,
}

/// What caused a job to be submitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Scheduled { schedule_id: String },
}

impl Trigger {
    /// Manual triggers outrank scheduled ones when resolving conflicts
    pub fn priority(&self) -> u8 {
        match self {
            Trigger::Manual => 10,
            Trigger::Scheduled { .. } => 1,
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, Trigger::Manual)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    #[default]
    Queued,
    Preparing,
    Transferring,
    Finalizing,
    Reading,
    Verifying,
    Decoding,
    Writing,
    CleaningUp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProgressSnapshot {
    pub stage: JobStage,
    pub current: u64,
    pub total: u64,
    pub current_item: Option<String>,
    pub throughput_bytes_per_sec: f64,
    pub eta_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobStatistics {
    pub files_processed: u64,
    pub bytes_processed: u64,
    pub bytes_written: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&BackupError> for JobError {
    fn from(error: &BackupError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

/// A single backup execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: Uuid,
    pub policy_id: String,
    pub backup_type: BackupType,
    pub trigger: Trigger,
    pub status: JobStatus,
    pub progress: ProgressSnapshot,
    pub statistics: JobStatistics,
    /// Record id of the produced backup, set on completion
    pub result: Option<Uuid>,
    pub error: Option<JobError>,
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BackupJob {
    pub fn new(policy_id: &str, backup_type: BackupType, trigger: Trigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            policy_id: policy_id.to_string(),
            backup_type,
            trigger,
            status: JobStatus::Pending,
            progress: ProgressSnapshot::default(),
            statistics: JobStatistics::default(),
            result: None,
            error: None,
            warnings: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn transition(&mut self, to: JobStatus) -> Result<()> {
        validate_transition(self.status, to)?;
        stamp(&mut self.started_at, &mut self.finished_at, to);
        self.status = to;
        Ok(())
    }
}

/// A single restore execution. Created only from an accepted preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreJob {
    pub id: Uuid,
    pub backup_id: Uuid,
    pub policy_id: String,
    pub scope: RestoreScope,
    pub target: String,
    pub options: RestoreOptions,
    pub status: JobStatus,
    pub progress: ProgressSnapshot,
    pub statistics: JobStatistics,
    pub result: Option<RestoreReport>,
    pub error: Option<JobError>,
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RestoreJob {
    pub fn new(
        backup_id: Uuid,
        policy_id: &str,
        scope: RestoreScope,
        target: &str,
        options: RestoreOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            backup_id,
            policy_id: policy_id.to_string(),
            scope,
            target: target.to_string(),
            options,
            status: JobStatus::Pending,
            progress: ProgressSnapshot::default(),
            statistics: JobStatistics::default(),
            result: None,
            error: None,
            warnings: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn transition(&mut self, to: JobStatus) -> Result<()> {
        validate_transition(self.status, to)?;
        stamp(&mut self.started_at, &mut self.finished_at, to);
        self.status = to;
        Ok(())
    }
}

fn stamp(
    started_at: &mut Option<DateTime<Utc>>,
    finished_at: &mut Option<DateTime<Utc>>,
    to: JobStatus,
) {
    let now = Utc::now();
    if to == JobStatus::Running && started_at.is_none() {
        *started_at = Some(now);
    }
    if to.is_terminal() {
        *finished_at = Some(now);
    }
}

/// Owner side of a job's cooperative controls.
#[derive(Debug)]
pub struct JobHandle {
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
}

impl JobHandle {
    pub fn new() -> (Self, JobControl) {
        let cancel = CancellationToken::new();
        let (pause, paused) = watch::channel(false);
        let control = JobControl {
            cancel: cancel.clone(),
            paused,
        };
        (Self { cancel, pause }, control)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn set_paused(&self, paused: bool) {
        let _ = self.pause.send(paused);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Worker side of a job's cooperative controls, checked between chunks.
#[derive(Debug, Clone)]
pub struct JobControl {
    cancel: CancellationToken,
    paused: watch::Receiver<bool>,
}

impl JobControl {
    /// Control for work that is never paused or cancelled from outside
    pub fn detached() -> Self {
        JobHandle::new().1
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns `Cancelled` once the job is cancelled; blocks while paused.
    pub async fn checkpoint(&mut self) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }
            if !*self.paused.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                changed = self.paused.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = self.cancel.cancelled() => return Err(BackupError::Cancelled),
            }
        }
    }

    /// Sleep that wakes early with `Cancelled`
    pub async fn sleep(&self, duration: std::time::Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel.cancelled() => Err(BackupError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for next in [
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Paused,
                JobStatus::Completed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(validate_transition(JobStatus::Completed, JobStatus::Running).is_err());
    }

    #[test]
    fn test_paused_only_from_and_back_to_running() {
        assert!(JobStatus::Running.can_transition_to(JobStatus::Paused));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Paused));
        assert!(JobStatus::Paused.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Paused.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Paused.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_job_transition_stamps_times() {
        let mut job = BackupJob::new("nightly", BackupType::Full, Trigger::Manual);
        assert!(job.started_at.is_none());
        job.transition(JobStatus::Running).unwrap();
        assert!(job.started_at.is_some());
        job.transition(JobStatus::Completed).unwrap();
        assert!(job.finished_at.is_some());
        assert!(job.transition(JobStatus::Running).is_err());
    }

    #[test]
    fn test_manual_trigger_outranks_scheduled() {
        let scheduled = Trigger::Scheduled {
            schedule_id: "nightly".to_string(),
        };
        assert!(Trigger::Manual.priority() > scheduled.priority());
    }

    #[tokio::test]
    async fn test_checkpoint_observes_cancel_while_paused() {
        let (handle, mut control) = JobHandle::new();
        handle.set_paused(true);

        let waiter = tokio::spawn(async move { control.checkpoint().await });
        tokio::task::yield_now().await;
        handle.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(BackupError::Cancelled)));
    }

    #[tokio::test]
    async fn test_checkpoint_resumes_after_unpause() {
        let (handle, mut control) = JobHandle::new();
        handle.set_paused(true);

        let waiter = tokio::spawn(async move { control.checkpoint().await });
        tokio::task::yield_now().await;
        handle.set_paused(false);

        assert!(waiter.await.unwrap().is_ok());
    }
}
