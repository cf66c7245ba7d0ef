use super::{ComponentHealth, HealthStatus, SystemHealth};
use crate::backup::JobOrchestrator;
use crate::storage::StorageManager;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HealthChecker {
    storage: Arc<StorageManager>,
    orchestrator: Arc<JobOrchestrator>,
    start_time: SystemTime,
    component_thresholds: HealthThresholds,
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub max_response_time_ms: u64,
    /// Queue fill ratio above which the orchestrator reports degraded
    pub max_queue_utilization: f64,
    pub max_pending_replications: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_response_time_ms: 1000,
            max_queue_utilization: 0.8,
            max_pending_replications: 100,
        }
    }
}

impl HealthChecker {
    pub fn new(storage: Arc<StorageManager>, orchestrator: Arc<JobOrchestrator>) -> Self {
        Self {
            storage,
            orchestrator,
            start_time: SystemTime::now(),
            component_thresholds: HealthThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.component_thresholds = thresholds;
        self
    }

    /// Health of the record index, the orchestrator, replication and every
    /// provider, using cached provider test results.
    pub async fn check_system_health(&self) -> Result<SystemHealth> {
        let start_check = Instant::now();
        let mut components = HashMap::new();

        components.insert("record_index".to_string(), self.check_record_index().await);
        components.insert("orchestrator".to_string(), self.check_orchestrator());
        components.insert("replication".to_string(), self.check_replication());

        for status in self.storage.list_providers().await? {
            let health = match (&status.health, status.enabled) {
                (_, false) => component(HealthStatus::Degraded, Some("disabled".to_string()), None),
                (None, true) => component(
                    HealthStatus::Healthy,
                    Some("not tested yet".to_string()),
                    None,
                ),
                (Some(result), true) if result.success => component(
                    if result.latency_ms > self.component_thresholds.max_response_time_ms {
                        HealthStatus::Degraded
                    } else {
                        HealthStatus::Healthy
                    },
                    None,
                    Some(result.latency_ms),
                ),
                (Some(result), true) => ComponentHealth {
                    status: HealthStatus::Unhealthy,
                    message: Some(result.message.clone()),
                    last_checked: result.tested_at,
                    response_time_ms: Some(result.latency_ms),
                    error_count: 1,
                },
            };
            components.insert(format!("provider:{}", status.name), health);
        }

        let overall_status = determine_overall_status(&components);
        let uptime = self
            .start_time
            .elapsed()
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_secs();

        debug!(
            "System health check completed in {}ms",
            start_check.elapsed().as_millis()
        );
        Ok(SystemHealth {
            status: overall_status,
            timestamp: Utc::now(),
            components,
            uptime_seconds: uptime,
            running_jobs: self.orchestrator.running_jobs(),
            queued_jobs: self.orchestrator.queued_jobs(),
        })
    }

    async fn check_record_index(&self) -> ComponentHealth {
        let start = Instant::now();
        match self.storage.index().list_all().await {
            Ok(_) => {
                let elapsed = start.elapsed().as_millis() as u64;
                let status = if elapsed > self.component_thresholds.max_response_time_ms {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                };
                component(status, None, Some(elapsed))
            }
            Err(e) => {
                warn!("Record index health check failed: {}", e);
                ComponentHealth {
                    error_count: 1,
                    ..component(HealthStatus::Unhealthy, Some(e.to_string()), None)
                }
            }
        }
    }

    fn check_orchestrator(&self) -> ComponentHealth {
        let max_queue = self.orchestrator.config().max_queue.max(1);
        let utilization = self.orchestrator.queued_jobs() as f64 / max_queue as f64;
        if utilization >= 1.0 {
            component(HealthStatus::Unhealthy, Some("job queue is full".to_string()), None)
        } else if utilization > self.component_thresholds.max_queue_utilization {
            component(
                HealthStatus::Degraded,
                Some(format!("job queue {:.0}% full", utilization * 100.0)),
                None,
            )
        } else {
            component(HealthStatus::Healthy, None, None)
        }
    }

    fn check_replication(&self) -> ComponentHealth {
        let pending = self.storage.pending_replications();
        if pending > self.component_thresholds.max_pending_replications {
            component(
                HealthStatus::Degraded,
                Some(format!("{pending} replications pending")),
                None,
            )
        } else {
            component(HealthStatus::Healthy, None, None)
        }
    }
}

fn component(
    status: HealthStatus,
    message: Option<String>,
    response_time_ms: Option<u64>,
) -> ComponentHealth {
    ComponentHealth {
        status,
        message,
        last_checked: Utc::now(),
        response_time_ms,
        error_count: 0,
    }
}

pub fn determine_overall_status(components: &HashMap<String, ComponentHealth>) -> HealthStatus {
    let statuses: Vec<&HealthStatus> = components.values().map(|c| &c.status).collect();
    if statuses.iter().any(|s| **s == HealthStatus::Unhealthy) {
        HealthStatus::Unhealthy
    } else if statuses.iter().any(|s| **s == HealthStatus::Degraded) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_component_wins() {
        let mut components = HashMap::new();
        components.insert("a".to_string(), component(HealthStatus::Healthy, None, None));
        assert_eq!(determine_overall_status(&components), HealthStatus::Healthy);

        components.insert("b".to_string(), component(HealthStatus::Degraded, None, None));
        assert_eq!(determine_overall_status(&components), HealthStatus::Degraded);

        components.insert("c".to_string(), component(HealthStatus::Unhealthy, None, None));
        assert_eq!(determine_overall_status(&components), HealthStatus::Unhealthy);
    }
}
