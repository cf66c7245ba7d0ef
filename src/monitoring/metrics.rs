use crate::backup::JobStatus;
use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use tracing::error;

/// Prometheus metrics for the backup engine
#[derive(Debug)]
pub struct BackupMetrics {
    registry: Arc<Registry>,

    // Job metrics
    pub jobs_submitted_total: IntCounter,
    pub jobs_rejected_total: IntCounter,
    pub jobs_finished_total: IntCounterVec,
    pub jobs_running: IntGauge,
    pub jobs_queued: IntGauge,
    pub job_duration_seconds: Histogram,
    pub job_retries_total: IntCounter,

    // Data metrics
    pub bytes_processed_total: IntCounter,
    pub bytes_stored_total: IntCounter,

    // Restore metrics
    pub restores_finished_total: IntCounterVec,

    // Retention and integrity
    pub retention_deleted_total: IntCounter,
    pub retention_archived_total: IntCounter,
    pub integrity_alerts_total: IntCounter,
    pub verifications_total: IntCounterVec,
}

impl BackupMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let jobs_submitted_total = IntCounter::with_opts(Opts::new(
            "backup_jobs_submitted_total",
            "Backup jobs admitted (started or queued)",
        ))?;
        registry.register(Box::new(jobs_submitted_total.clone()))?;

        let jobs_rejected_total = IntCounter::with_opts(Opts::new(
            "backup_jobs_rejected_total",
            "Backup triggers skipped by conflict resolution or a full queue",
        ))?;
        registry.register(Box::new(jobs_rejected_total.clone()))?;

        let jobs_finished_total = IntCounterVec::new(
            Opts::new("backup_jobs_finished_total", "Backup jobs by terminal status"),
            &["status"],
        )?;
        registry.register(Box::new(jobs_finished_total.clone()))?;

        let jobs_running = IntGauge::with_opts(Opts::new(
            "backup_jobs_running",
            "Jobs currently holding a worker slot",
        ))?;
        registry.register(Box::new(jobs_running.clone()))?;

        let jobs_queued = IntGauge::with_opts(Opts::new(
            "backup_jobs_queued",
            "Jobs waiting for admission",
        ))?;
        registry.register(Box::new(jobs_queued.clone()))?;

        let job_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "backup_job_duration_seconds",
                "Wall time of finished backup jobs",
            )
            .buckets(exponential_buckets(0.1, 2.0, 16)?),
        )?;
        registry.register(Box::new(job_duration_seconds.clone()))?;

        let job_retries_total = IntCounter::with_opts(Opts::new(
            "backup_job_retries_total",
            "Attempts beyond the first",
        ))?;
        registry.register(Box::new(job_retries_total.clone()))?;

        let bytes_processed_total = IntCounter::with_opts(Opts::new(
            "backup_bytes_processed_total",
            "Plaintext bytes read from sources",
        ))?;
        registry.register(Box::new(bytes_processed_total.clone()))?;

        let bytes_stored_total = IntCounter::with_opts(Opts::new(
            "backup_bytes_stored_total",
            "Bytes written to primary providers",
        ))?;
        registry.register(Box::new(bytes_stored_total.clone()))?;

        let restores_finished_total = IntCounterVec::new(
            Opts::new("backup_restores_finished_total", "Restore jobs by terminal status"),
            &["status"],
        )?;
        registry.register(Box::new(restores_finished_total.clone()))?;

        let retention_deleted_total = IntCounter::with_opts(Opts::new(
            "backup_retention_deleted_total",
            "Records removed by retention",
        ))?;
        registry.register(Box::new(retention_deleted_total.clone()))?;

        let retention_archived_total = IntCounter::with_opts(Opts::new(
            "backup_retention_archived_total",
            "Records archived by retention",
        ))?;
        registry.register(Box::new(retention_archived_total.clone()))?;

        let integrity_alerts_total = IntCounter::with_opts(Opts::new(
            "backup_integrity_alerts_total",
            "Integrity alerts raised",
        ))?;
        registry.register(Box::new(integrity_alerts_total.clone()))?;

        let verifications_total = IntCounterVec::new(
            Opts::new("backup_verifications_total", "Verification runs by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(verifications_total.clone()))?;

        Ok(Self {
            registry,
            jobs_submitted_total,
            jobs_rejected_total,
            jobs_finished_total,
            jobs_running,
            jobs_queued,
            job_duration_seconds,
            job_retries_total,
            bytes_processed_total,
            bytes_stored_total,
            restores_finished_total,
            retention_deleted_total,
            retention_archived_total,
            integrity_alerts_total,
            verifications_total,
        })
    }

    pub fn record_backup_finished(&self, status: JobStatus, duration_secs: f64, attempts: u32) {
        self.jobs_finished_total
            .with_label_values(&[&status.to_string()])
            .inc();
        self.job_duration_seconds.observe(duration_secs);
        if attempts > 1 {
            self.job_retries_total.inc_by(u64::from(attempts - 1));
        }
    }

    pub fn record_restore_finished(&self, status: JobStatus) {
        self.restores_finished_total
            .with_label_values(&[&status.to_string()])
            .inc();
    }

    pub fn record_verification(&self, passed: bool) {
        let outcome = if passed { "passed" } else { "failed" };
        self.verifications_total.with_label_values(&[outcome]).inc();
        if !passed {
            self.integrity_alerts_total.inc();
        }
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Text exposition of every registered metric
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_export() {
        let metrics = BackupMetrics::new().unwrap();
        metrics.record_backup_finished(JobStatus::Completed, 1.5, 3);
        metrics.record_verification(false);

        let text = metrics.gather();
        assert!(text.contains("backup_jobs_finished_total"));
        assert_eq!(metrics.job_retries_total.get(), 2);
        assert_eq!(metrics.integrity_alerts_total.get(), 1);
    }
}
