//! Decides when each policy's backups run.
//!
//! Frequencies are normalised to six-field cron expressions and evaluated in
//! the schedule's fixed-offset timezone. The service keeps one `next_run` per
//! (policy, schedule) pair and, on every tick, hands due schedules to the
//! orchestrator. Firings missed while the process was down or busy are
//! coalesced into a single trigger.

use super::events::{EventBus, LifecycleEvent};
use super::job::Trigger;
use super::orchestrator::{Admission, JobOrchestrator};
use super::policy::PolicyStore;
use super::{BackupError, Result};
use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Frequency {
    /// Never fires on its own
    Manual,
    Hourly {
        minute: u32,
    },
    Daily {
        hour: u32,
        minute: u32,
    },
    Weekly {
        day: Weekday,
        hour: u32,
        minute: u32,
    },
    Monthly {
        day: u32,
        hour: u32,
        minute: u32,
    },
    /// Five-field (minute precision) or six/seven-field cron expression
    Custom {
        expression: String,
    },
}

impl Frequency {
    /// Cron expression with a leading seconds field, `None` for manual schedules
    pub fn to_cron(&self) -> Option<String> {
        let expression = match self {
            Frequency::Manual => return None,
            Frequency::Hourly { minute } => format!("0 {minute} * * * *"),
            Frequency::Daily { hour, minute } => format!("0 {minute} {hour} * * *"),
            Frequency::Weekly { day, hour, minute } => format!("0 {minute} {hour} * * {day}"),
            Frequency::Monthly { day, hour, minute } => format!("0 {minute} {hour} {day} * *"),
            Frequency::Custom { expression } => {
                let expression = expression.trim();
                if expression.split_whitespace().count() == 5 {
                    format!("0 {expression}")
                } else {
                    expression.to_string()
                }
            }
        };
        Some(expression)
    }

    fn check_ranges(&self) -> std::result::Result<(), String> {
        let (minute, hour) = match self {
            Frequency::Manual | Frequency::Custom { .. } => return Ok(()),
            Frequency::Hourly { minute } => (*minute, 0),
            Frequency::Daily { hour, minute } | Frequency::Weekly { hour, minute, .. } => {
                (*minute, *hour)
            }
            Frequency::Monthly { day, hour, minute } => {
                if !(1..=31).contains(day) {
                    return Err(format!("day {day} is outside 1..=31"));
                }
                (*minute, *hour)
            }
        };
        if minute > 59 {
            return Err(format!("minute {minute} is outside 0..=59"));
        }
        if hour > 23 {
            return Err(format!("hour {hour} is outside 0..=23"));
        }
        Ok(())
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Schedule {
    pub id: String,
    pub frequency: Frequency,
    /// `UTC` or a fixed offset such as `+02:00`
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Schedule {
    pub fn is_manual(&self) -> bool {
        self.frequency == Frequency::Manual
    }

    /// Structural checks. Custom cron expressions are only parsed by
    /// [`check_expression`](Self::check_expression) so that a bad expression
    /// disables one schedule at tick time instead of rejecting the policy.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(BackupError::config("schedule id must not be empty"));
        }
        parse_offset(&self.timezone)?;
        self.frequency
            .check_ranges()
            .map_err(|message| BackupError::config(format!("schedule {}: {message}", self.id)))
    }

    pub fn check_expression(&self) -> Result<()> {
        self.cron().map(|_| ())
    }

    fn cron(&self) -> Result<Option<cron::Schedule>> {
        let Some(expression) = self.frequency.to_cron() else {
            return Ok(None);
        };
        cron::Schedule::from_str(&expression)
            .map(Some)
            .map_err(|e| {
                BackupError::config(format!(
                    "schedule {}: invalid cron expression '{expression}': {e}",
                    self.id
                ))
            })
    }

    /// First firing strictly after `after`, `None` when the schedule never fires.
    pub fn next_run_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let Some(cron) = self.cron()? else {
            return Ok(None);
        };
        let offset = parse_offset(&self.timezone)?;
        Ok(cron
            .after(&after.with_timezone(&offset))
            .next()
            .map(|at| at.with_timezone(&Utc)))
    }
}

/// Parses `UTC`, `Z` or `±HH:MM` into a fixed offset.
pub fn parse_offset(timezone: &str) -> Result<FixedOffset> {
    let invalid = || BackupError::config(format!("unsupported timezone '{timezone}'"));
    let tz = timezone.trim();
    if tz.eq_ignore_ascii_case("utc") || tz == "Z" {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }

    let (sign, rest) = match tz.as_bytes().first() {
        Some(b'+') => (1, &tz[1..]),
        Some(b'-') => (-1, &tz[1..]),
        _ => return Err(invalid()),
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(invalid)?;
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 14 || minutes > 59 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// Time-of-day window outside which scheduled triggers are vetoed.
///
/// A window whose end is earlier than its start crosses midnight and belongs
/// to the day it starts on. An empty `days` list means every day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MaintenanceWindow {
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub days: Vec<Weekday>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl MaintenanceWindow {
    fn bounds(&self) -> Result<(NaiveTime, NaiveTime)> {
        let parse = |value: &str| {
            NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| {
                BackupError::config(format!("maintenance window time '{value}' is not HH:MM"))
            })
        };
        Ok((parse(&self.start)?, parse(&self.end)?))
    }

    pub fn validate(&self) -> Result<()> {
        let (start, end) = self.bounds()?;
        if start == end {
            return Err(BackupError::config(
                "maintenance window start and end must differ",
            ));
        }
        parse_offset(&self.timezone)?;
        Ok(())
    }

    pub fn allows(&self, at: DateTime<Utc>) -> bool {
        let (Ok((start, end)), Ok(offset)) = (self.bounds(), parse_offset(&self.timezone)) else {
            return false;
        };
        let local = at.with_timezone(&offset);
        let time = local.time();
        let day_allowed = |day: Weekday| self.days.is_empty() || self.days.contains(&day);

        if start < end {
            time >= start && time < end && day_allowed(local.weekday())
        } else if time >= start {
            day_allowed(local.weekday())
        } else if time < end {
            day_allowed(local.weekday().pred())
        } else {
            false
        }
    }
}

/// Source of "now" for the scheduler.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone)]
struct ScheduleState {
    schedule: Schedule,
    next_run: Option<DateTime<Utc>>,
    disabled: bool,
    error: Option<String>,
}

/// What one tick did.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TickReport {
    pub started: Vec<Uuid>,
    pub queued: Vec<Uuid>,
    /// Rejected by conflict resolution
    pub skipped: usize,
    /// Blocked by the maintenance window
    pub vetoed: usize,
    /// Schedules disabled during this tick
    pub disabled: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScheduledRun {
    pub policy_id: String,
    pub schedule_id: String,
    pub next_run: Option<DateTime<Utc>>,
    pub disabled: bool,
    /// Why the schedule cannot fire
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct SchedulerService {
    clock: Arc<dyn Clock>,
    policies: Arc<PolicyStore>,
    orchestrator: Arc<JobOrchestrator>,
    events: Arc<EventBus>,
    window: Option<MaintenanceWindow>,
    state: tokio::sync::Mutex<HashMap<(String, String), ScheduleState>>,
}

impl SchedulerService {
    pub fn new(
        clock: Arc<dyn Clock>,
        policies: Arc<PolicyStore>,
        orchestrator: Arc<JobOrchestrator>,
        events: Arc<EventBus>,
        window: Option<MaintenanceWindow>,
    ) -> Self {
        Self {
            clock,
            policies,
            orchestrator,
            events,
            window,
            state: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Option<&MaintenanceWindow> {
        self.window.as_ref()
    }

    /// Syncs per-schedule state with the policy store and returns the
    /// schedules due at `now`, advancing their `next_run` past it.
    async fn collect_due(
        &self,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Vec<(String, String)> {
        let policies = self.policies.list().await;
        let mut state = self.state.lock().await;
        let mut live = HashSet::new();
        let mut due = Vec::new();

        for policy in policies.iter().filter(|p| p.enabled) {
            for schedule in policy
                .schedules
                .iter()
                .filter(|s| s.enabled && !s.is_manual())
            {
                let key = (policy.id.clone(), schedule.id.clone());
                live.insert(key.clone());

                let entry = state.entry(key.clone()).or_insert_with(|| ScheduleState {
                    schedule: schedule.clone(),
                    next_run: None,
                    disabled: false,
                    error: None,
                });
                if entry.schedule != *schedule {
                    debug!(policy_id = %policy.id, schedule_id = %schedule.id, "Schedule changed, recomputing");
                    *entry = ScheduleState {
                        schedule: schedule.clone(),
                        next_run: None,
                        disabled: false,
                        error: None,
                    };
                }
                if entry.disabled {
                    continue;
                }

                let fires = entry.next_run.is_some_and(|next| next <= now);
                if entry.next_run.is_some() && !fires {
                    continue;
                }

                match schedule.next_run_after(now) {
                    Ok(Some(next)) => entry.next_run = Some(next),
                    Ok(None) => {
                        info!(policy_id = %policy.id, schedule_id = %schedule.id, "Schedule has no future firings");
                        entry.next_run = None;
                        entry.disabled = true;
                    }
                    Err(e) => {
                        error!(policy_id = %policy.id, schedule_id = %schedule.id, error = %e, "Disabling schedule");
                        entry.next_run = None;
                        entry.disabled = true;
                        entry.error = Some(e.to_string());
                        report.disabled += 1;
                        self.events.publish(LifecycleEvent::ConfigurationError {
                            entity: format!("schedule {}/{}", policy.id, schedule.id),
                            message: e.to_string(),
                        });
                        continue;
                    }
                }

                if fires {
                    due.push(key);
                }
            }
        }

        state.retain(|key, _| live.contains(key));
        due
    }

    /// Fires every due schedule once.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> TickReport {
        let now = self.clock.now();
        let mut report = TickReport::default();
        let due = self.collect_due(now, &mut report).await;

        for (policy_id, schedule_id) in due {
            if let Some(window) = &self.window {
                if !window.allows(now) {
                    warn!(policy_id = %policy_id, schedule_id = %schedule_id, "Trigger outside maintenance window");
                    report.vetoed += 1;
                    self.events.publish(LifecycleEvent::TriggerSkipped {
                        policy_id: policy_id.clone(),
                        reason: "outside maintenance window".to_string(),
                    });
                    continue;
                }
            }

            let trigger = Trigger::Scheduled {
                schedule_id: schedule_id.clone(),
            };
            match self.orchestrator.submit_backup(&policy_id, trigger).await {
                Ok(Admission::Started { job_id }) => report.started.push(job_id),
                Ok(Admission::Queued { job_id, .. }) => report.queued.push(job_id),
                Ok(Admission::Rejected { .. }) => report.skipped += 1,
                Err(e) => {
                    error!(policy_id = %policy_id, schedule_id = %schedule_id, error = %e, "Scheduled trigger failed");
                    report.skipped += 1;
                }
            }
        }

        if !report.started.is_empty() || !report.queued.is_empty() {
            info!(
                started = report.started.len(),
                queued = report.queued.len(),
                "Scheduler tick dispatched jobs"
            );
        }
        report
    }

    /// Manual triggers bypass the maintenance window.
    pub async fn trigger_manual(&self, policy_id: &str) -> Result<Admission> {
        self.orchestrator
            .submit_backup(policy_id, Trigger::Manual)
            .await
    }

    /// Upcoming firing of every active schedule. Read-only: schedules no tick
    /// has seen yet are previewed, and a malformed one shows up disabled with
    /// its error until the next tick disables it for real.
    pub async fn next_runs(&self) -> Vec<ScheduledRun> {
        let now = self.clock.now();
        let policies = self.policies.list().await;
        let state = self.state.lock().await;

        let mut runs = Vec::new();
        for policy in policies.iter().filter(|p| p.enabled) {
            for schedule in policy.schedules.iter().filter(|s| s.enabled && !s.is_manual()) {
                let key = (policy.id.clone(), schedule.id.clone());
                let run = match state.get(&key).filter(|s| s.schedule == *schedule) {
                    Some(known) => ScheduledRun {
                        policy_id: key.0,
                        schedule_id: key.1,
                        next_run: known.next_run,
                        disabled: known.disabled,
                        error: known.error.clone(),
                    },
                    None => {
                        let (next_run, error) = match schedule.next_run_after(now) {
                            Ok(next_run) => (next_run, None),
                            Err(e) => (None, Some(e.to_string())),
                        };
                        ScheduledRun {
                            policy_id: key.0,
                            schedule_id: key.1,
                            next_run,
                            disabled: next_run.is_none(),
                            error,
                        }
                    }
                };
                runs.push(run);
            }
        }
        runs.sort_by(|a, b| {
            (a.policy_id.as_str(), a.schedule_id.as_str())
                .cmp(&(b.policy_id.as_str(), b.schedule_id.as_str()))
        });
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn schedule(frequency: Frequency, timezone: &str) -> Schedule {
        Schedule {
            id: "s".to_string(),
            frequency,
            timezone: timezone.to_string(),
            enabled: true,
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_daily_next_run_in_utc() {
        let daily = schedule(Frequency::Daily { hour: 2, minute: 30 }, "UTC");
        assert_eq!(
            daily.next_run_after(at(2024, 3, 10, 1, 0)).unwrap(),
            Some(at(2024, 3, 10, 2, 30))
        );
        assert_eq!(
            daily.next_run_after(at(2024, 3, 10, 2, 30)).unwrap(),
            Some(at(2024, 3, 11, 2, 30))
        );
    }

    #[test]
    fn test_next_run_honours_offset() {
        let daily = schedule(Frequency::Daily { hour: 2, minute: 0 }, "+02:00");
        // 02:00 at +02:00 is midnight UTC
        assert_eq!(
            daily.next_run_after(at(2024, 3, 10, 12, 0)).unwrap(),
            Some(at(2024, 3, 11, 0, 0))
        );
    }

    #[test]
    fn test_weekly_and_five_field_custom() {
        let weekly = schedule(
            Frequency::Weekly {
                day: Weekday::Sun,
                hour: 3,
                minute: 0,
            },
            "UTC",
        );
        // 2024-03-13 is a Wednesday
        assert_eq!(
            weekly.next_run_after(at(2024, 3, 13, 0, 0)).unwrap(),
            Some(at(2024, 3, 17, 3, 0))
        );

        let custom = schedule(
            Frequency::Custom {
                expression: "15 */6 * * *".to_string(),
            },
            "UTC",
        );
        assert_eq!(
            custom.next_run_after(at(2024, 3, 13, 7, 0)).unwrap(),
            Some(at(2024, 3, 13, 12, 15))
        );
    }

    #[test]
    fn test_manual_never_fires() {
        let manual = schedule(Frequency::Manual, "UTC");
        assert_eq!(manual.next_run_after(Utc::now()).unwrap(), None);
    }

    #[test]
    fn test_malformed_cron_is_a_config_error() {
        let broken = schedule(
            Frequency::Custom {
                expression: "every tuesday".to_string(),
            },
            "UTC",
        );
        assert!(broken.validate().is_ok());
        assert!(matches!(
            broken.next_run_after(Utc::now()),
            Err(BackupError::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn test_out_of_range_fields_rejected() {
        let bad = schedule(Frequency::Daily { hour: 24, minute: 0 }, "UTC");
        assert!(bad.validate().is_err());
        let bad_tz = schedule(Frequency::Hourly { minute: 5 }, "Europe/Nowhere");
        assert!(bad_tz.validate().is_err());
    }

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset("UTC").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_offset("+05:30").unwrap().local_minus_utc(), 19_800);
        assert_eq!(parse_offset("-03:00").unwrap().local_minus_utc(), -10_800);
        assert!(parse_offset("0300").is_err());
    }

    #[test]
    fn test_window_crossing_midnight_belongs_to_start_day() {
        let window = MaintenanceWindow {
            start: "22:00".to_string(),
            end: "04:00".to_string(),
            days: vec![Weekday::Sat],
            timezone: "UTC".to_string(),
        };
        // 2024-03-16 is a Saturday
        assert!(window.allows(at(2024, 3, 16, 23, 0)));
        assert!(window.allows(at(2024, 3, 17, 3, 59)));
        assert!(!window.allows(at(2024, 3, 17, 4, 0)));
        assert!(!window.allows(at(2024, 3, 17, 23, 0)));
        assert!(!window.allows(at(2024, 3, 16, 12, 0)));
    }

    #[test]
    fn test_frequency_parses_from_toml() {
        let schedule: Schedule = toml::from_str(
            r#"
            id = "weekly"
            timezone = "-05:00"
            frequency = { type = "weekly", day = "Mon", hour = 1, minute = 15 }
            "#,
        )
        .unwrap();
        assert_eq!(
            schedule.frequency.to_cron().as_deref(),
            Some("0 15 1 * * Mon")
        );
    }
}
