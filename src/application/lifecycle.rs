use crate::application::DependencyContainer;
use crate::backup::{JobKind, JobStatus, LifecycleEvent};
use anyhow::Result;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs the background services of a serving process and shuts them down
pub struct ApplicationLifecycle {
    container: Arc<DependencyContainer>,
    shutdown: CancellationToken,
    scheduler: Mutex<Option<JobScheduler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ApplicationLifecycle {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self {
            container,
            shutdown: CancellationToken::new(),
            scheduler: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Initialize the application
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing application...");

        if !self.container.health_check().await? {
            return Err(anyhow::anyhow!("Initial health check failed"));
        }

        info!("Application initialized");
        Ok(())
    }

    /// Starts the replication worker, post-backup retention and the cron driver
    pub async fn start_background_services(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;

        if let Some(handle) = self
            .container
            .storage
            .start_replication_worker(self.shutdown.clone())
            .await
        {
            tasks.push(handle);
        }
        tasks.push(self.spawn_retention_listener());
        drop(tasks);

        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize job scheduler: {}", e))?;

        let config = &self.container.config;
        let container = self.container.clone();
        Self::add_cron_job(&scheduler, "schedule-tick", &config.scheduler.tick_cron, move || {
            let container = container.clone();
            async move {
                let report = container.scheduler.tick().await;
                if !report.started.is_empty() || !report.queued.is_empty() {
                    info!(
                        started = report.started.len(),
                        queued = report.queued.len(),
                        skipped = report.skipped,
                        vetoed = report.vetoed,
                        "Scheduled backups submitted"
                    );
                }
            }
        })
        .await?;

        let container = self.container.clone();
        Self::add_cron_job(
            &scheduler,
            "retention-sweep",
            &config.scheduler.retention_cron,
            move || {
                let container = container.clone();
                async move {
                    for (policy_id, result) in container.retention.sweep().await {
                        match result {
                            Ok(outcome) => container.record_retention(&outcome),
                            Err(e) => warn!(policy_id = %policy_id, error = %e, "Retention sweep failed"),
                        }
                    }
                }
            },
        )
        .await?;

        if !config.lifecycle_rules.is_empty() {
            let container = self.container.clone();
            Self::add_cron_job(
                &scheduler,
                "lifecycle-rules",
                &config.scheduler.lifecycle_cron,
                move || {
                    let container = container.clone();
                    async move {
                        match container.lifecycle.run(Utc::now()).await {
                            Ok(report) => info!(
                                archived = report.archived.len(),
                                moved = report.moved.len(),
                                deleted = report.deleted.len(),
                                failed = report.failed.len(),
                                "Lifecycle rules applied"
                            ),
                            Err(e) => error!(error = %e, "Lifecycle run failed"),
                        }
                    }
                },
            )
            .await?;
        }

        if config.verification.enabled {
            let container = self.container.clone();
            Self::add_cron_job(&scheduler, "verification", &config.verification.cron, move || {
                let container = container.clone();
                async move {
                    if let Err(e) = container.verification.run().await {
                        error!(error = %e, "Verification run failed");
                    }
                }
            })
            .await?;
        }

        scheduler
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start job scheduler: {}", e))?;
        *self.scheduler.lock().await = Some(scheduler);

        info!("Background services started");
        Ok(())
    }

    async fn add_cron_job<F, Fut>(
        scheduler: &JobScheduler,
        name: &'static str,
        cron_expression: &str,
        run: F,
    ) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let run = Arc::new(run);
        let job = Job::new_async(cron_expression, move |_uuid, _l| {
            let run = run.clone();
            Box::pin(async move {
                debug!(job = name, "Cron job fired");
                run().await;
            })
        })
        .map_err(|e| anyhow::anyhow!("Failed to create cron job {}: {}", name, e))?;

        scheduler
            .add(job)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to add job {} to scheduler: {}", name, e))?;
        debug!(job = name, cron = cron_expression, "Cron job registered");
        Ok(())
    }

    /// Applies retention to a policy after each of its backups completes
    fn spawn_retention_listener(&self) -> JoinHandle<()> {
        let container = self.container.clone();
        let shutdown = self.shutdown.clone();
        let subscription = container.events.subscribe();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = subscription.recv() => event,
                };
                let LifecycleEvent::Terminal {
                    kind: JobKind::Backup,
                    status: JobStatus::Completed,
                    policy_id,
                    ..
                } = event
                else {
                    continue;
                };
                match container.retention.evaluate(&policy_id).await {
                    Ok(outcome) => container.record_retention(&outcome),
                    Err(e) => warn!(policy_id = %policy_id, error = %e, "Post-backup retention failed"),
                }
            }
        })
    }

    /// Graceful shutdown
    pub async fn shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown...");

        if let Some(mut scheduler) = self.scheduler.lock().await.take() {
            if let Err(e) = scheduler.shutdown().await {
                error!("Error stopping job scheduler: {}", e);
            }
        }

        self.container.orchestrator.shutdown().await;
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Background task ended abnormally: {}", e);
            }
        }

        info!("Graceful shutdown completed");
        Ok(())
    }

    /// Wait for shutdown signals
    pub async fn wait_for_shutdown(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed to install terminate signal handler: {}", e);
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("Shutdown signal received");
    }
}
