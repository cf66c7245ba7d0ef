use crate::api::create_api_router;
use crate::application::{ApplicationLifecycle, DependencyContainer};
use crate::backup::retention::RetentionAction;
use crate::backup::{Admission, JobStatus, Trigger};
use crate::Config;
use anyhow::Result;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub struct ServerCommandHandler {
    container: Arc<DependencyContainer>,
    lifecycle: Arc<ApplicationLifecycle>,
}

impl ServerCommandHandler {
    pub fn new(container: Arc<DependencyContainer>, lifecycle: Arc<ApplicationLifecycle>) -> Self {
        Self {
            container,
            lifecycle,
        }
    }

    /// Serves the HTTP API and runs background services until a shutdown signal
    pub async fn serve(&self) -> Result<()> {
        let server = &self.container.config.server;
        let address = format!("{}:{}", server.host, server.http_port);

        self.lifecycle.start_background_services().await?;

        let router = create_api_router(
            self.container.app_state(),
            Duration::from_secs(server.request_timeout_secs),
        );
        let listener = TcpListener::bind(&address).await?;
        info!(address = %address, "HTTP API listening");

        let lifecycle = self.lifecycle.clone();
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { lifecycle.wait_for_shutdown().await })
            .await;
        if let Err(e) = &served {
            error!("HTTP server error: {}", e);
        }

        self.lifecycle.shutdown().await?;
        served.map_err(Into::into)
    }
}

pub struct BackupCommandHandler {
    container: Arc<DependencyContainer>,
}

impl BackupCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    /// Runs one manual backup to completion, including async replication
    pub async fn run_backup(&self, policy_id: &str) -> Result<()> {
        let storage = &self.container.storage;
        let shutdown = tokio_util::sync::CancellationToken::new();
        let worker = storage.start_replication_worker(shutdown.clone()).await;

        let admission = self
            .container
            .orchestrator
            .submit_backup(policy_id, Trigger::Manual)
            .await?;
        let job_id = match admission {
            Admission::Rejected { reason } => {
                return Err(anyhow::anyhow!("Backup rejected: {}", reason));
            }
            other => other
                .job_id()
                .ok_or_else(|| anyhow::anyhow!("Admission carried no job id"))?,
        };
        info!(policy_id, job_id = %job_id, "Backup submitted");

        let job = self.container.orchestrator.wait_for(job_id).await?;
        storage.wait_for_replication().await;
        shutdown.cancel();
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        print_json(&job)?;
        match job.status {
            JobStatus::Completed => Ok(()),
            status => Err(anyhow::anyhow!("Backup finished as {}", status)),
        }
    }
}

pub struct RetentionCommandHandler {
    container: Arc<DependencyContainer>,
}

impl RetentionCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn run(&self, policy_id: &str, dry_run: bool) -> Result<()> {
        let retention = &self.container.retention;
        if dry_run {
            let plan = retention.dry_run(policy_id).await?;
            info!(
                policy_id,
                keep = plan.with_action(RetentionAction::Keep).len(),
                archive = plan.with_action(RetentionAction::Archive).len(),
                delete = plan.with_action(RetentionAction::Delete).len(),
                compress = plan.with_action(RetentionAction::Compress).len(),
                "Retention plan (dry run)"
            );
            return print_json(&plan);
        }

        let outcome = retention.evaluate(policy_id).await?;
        self.container.record_retention(&outcome);
        if !outcome.failed.is_empty() {
            warn!(policy_id, failed = outcome.failed.len(), "Some retention actions failed");
        }
        print_json(&outcome)
    }
}

pub struct ProviderCommandHandler {
    container: Arc<DependencyContainer>,
}

impl ProviderCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn list(&self, test: bool) -> Result<()> {
        if test {
            let results = self.container.storage.test_all().await?;
            for result in &results {
                if result.success {
                    info!(provider = %result.provider, latency_ms = result.latency_ms, "Provider reachable");
                } else {
                    error!(provider = %result.provider, message = %result.message, "Provider unreachable");
                }
            }
        }
        print_json(&self.container.storage.list_providers().await?)
    }
}

pub struct VerifyCommandHandler {
    container: Arc<DependencyContainer>,
}

impl VerifyCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn run(&self) -> Result<()> {
        let report = self.container.verification.run().await?;
        print_json(&report)?;
        if report.failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "{} backup(s) failed verification",
                report.failed.len()
            ))
        }
    }
}

/// Writes the sample configuration; refuses to overwrite without `force`
pub fn write_sample_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow::anyhow!(
            "{} already exists, pass --force to overwrite",
            path.display()
        ));
    }
    std::fs::write(path, Config::sample_toml())?;
    info!(path = %path.display(), "Sample configuration written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_sample_config_respects_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.toml");

        write_sample_config(&path, false).unwrap();
        assert!(write_sample_config(&path, false).is_err());
        write_sample_config(&path, true).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        Config::from_toml(&written).unwrap().validate().unwrap();
    }
}
