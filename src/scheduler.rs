//! Reminder jobs: time-expression parsing, the persisted job list and the ticker thread.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone, Timelike};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::now_ms;

pub(crate) const JOBS_FILE: &str = "jobs.json";
pub(crate) const TICK_INTERVAL: Duration = Duration::from_secs(1);

// ── Time expressions ─────────────────────────────────────────────────────

static DURATION_UNITS: LazyLock<Vec<(Regex, i64)>> = LazyLock::new(|| {
    [
        (r"(\d+)\s*(?:seconds?|secs?|s)\b", 1_000),
        (r"(\d+)\s*(?:minutes?|mins?|m)\b", 60_000),
        (r"(\d+)\s*(?:hours?|hrs?|h)\b", 3_600_000),
        (r"(\d+)\s*(?:days?|d)\b", 86_400_000),
    ]
    .into_iter()
    .filter_map(|(pattern, unit)| Regex::new(pattern).ok().map(|re| (re, unit)))
    .collect()
});

static AT_TIME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\bat\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?").ok());

/// Sum every `<n><unit>` in `text` (`5m`, `2 hours`, `1h 30m`). `None` when nothing matched.
pub(crate) fn parse_duration_ms(text: &str) -> Option<i64> {
    let lowered = text.to_lowercase();
    let mut total = 0i64;
    let mut found = false;
    for (re, unit) in DURATION_UNITS.iter() {
        for caps in re.captures_iter(&lowered) {
            if let Some(n) = caps.get(1).and_then(|m| m.as_str().parse::<i64>().ok()) {
                total = total.saturating_add(n.saturating_mul(*unit));
                found = true;
            }
        }
    }
    found.then_some(total)
}

/// `now_ms + delay_ms`, or `None` when the sum overflows or falls outside the calendar.
pub(crate) fn offset_ms(now_ms: i64, delay_ms: i64) -> Option<i64> {
    now_ms
        .checked_add(delay_ms)
        .filter(|at| Local.timestamp_millis_opt(*at).single().is_some())
}

/// Resolve `in 5 minutes`, `5m`, `at 3pm`, `at 14:30` or `tomorrow at 9am` to epoch ms.
pub(crate) fn parse_time_expression(text: &str, now: DateTime<Local>) -> Option<i64> {
    let lowered = text.trim().to_lowercase();
    let now_ms = now.timestamp_millis();

    if let Some(rest) = lowered.strip_prefix("in ") {
        if let Some(ms) = parse_duration_ms(rest).filter(|ms| *ms > 0) {
            return offset_ms(now_ms, ms);
        }
    }

    if let Some(caps) = AT_TIME.as_ref().and_then(|re| re.captures(&lowered)) {
        let mut hour: u32 = caps.get(1)?.as_str().parse().ok()?;
        let minute: u32 = caps.get(2).map(|m| m.as_str().parse().ok()).unwrap_or(Some(0))?;
        match caps.get(3).map(|m| m.as_str()) {
            Some("pm") if hour != 12 => hour += 12,
            Some("am") if hour == 12 => hour = 0,
            _ => {}
        }
        let naive = now.date_naive().and_hms_opt(hour, minute, 0)?;
        let mut target = Local.from_local_datetime(&naive).earliest()?;
        if target <= now {
            target += chrono::Duration::days(1);
        }
        if lowered.contains("tomorrow") && target.date_naive() == now.date_naive() {
            target += chrono::Duration::days(1);
        }
        return Some(target.timestamp_millis());
    }

    parse_duration_ms(&lowered)
        .filter(|ms| *ms > 0)
        .and_then(|ms| offset_ms(now_ms, ms))
}

/// Human phrasing of a trigger time, with the exact clock time so nobody recomputes it.
pub(crate) fn describe_trigger(target_ms: i64, now_ms: i64) -> String {
    let diff_secs = target_ms.saturating_sub(now_ms).max(0) / 1000;
    let Some(target) = Local.timestamp_millis_opt(target_ms).single() else {
        return format!("in {diff_secs} seconds");
    };
    let clock = target.format("%H:%M:%S");
    if diff_secs < 60 {
        format!("in {diff_secs} seconds (at {clock})")
    } else if diff_secs < 3600 {
        format!("in {} minutes (at {clock})", diff_secs / 60)
    } else if diff_secs < 86_400 {
        format!("at {}", target.format("%I:%M %p"))
    } else {
        format!("on {}", target.format("%b %d at %I:%M %p"))
    }
}

// ── Jobs ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum JobSchedule {
    At { at_ms: i64 },
    Every { every_ms: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum PayloadKind {
    /// Delivered to the channel as-is when `deliver` is set.
    SystemEvent,
    /// Handed to the agent as a system message.
    AgentTurn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct JobPayload {
    pub(crate) kind: PayloadKind,
    pub(crate) message: String,
    #[serde(default)]
    pub(crate) deliver: bool,
    #[serde(default)]
    pub(crate) channel: Option<String>,
    #[serde(default)]
    pub(crate) to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct CronJob {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) schedule: JobSchedule,
    pub(crate) payload: JobPayload,
    #[serde(default)]
    pub(crate) next_run_at_ms: Option<i64>,
    #[serde(default)]
    pub(crate) last_run_at_ms: Option<i64>,
    #[serde(default)]
    pub(crate) delete_after_run: bool,
    #[serde(default = "default_enabled")]
    pub(crate) enabled: bool,
    #[serde(default)]
    pub(crate) created_at_ms: i64,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JobFile {
    #[serde(default)]
    jobs: Vec<CronJob>,
}

/// Callback contract the agent and tools schedule through.
pub(crate) trait Scheduler: Send + Sync {
    fn add_job(
        &self,
        name: &str,
        schedule: JobSchedule,
        payload: JobPayload,
        delete_after_run: bool,
    ) -> Result<CronJob, String>;
    /// Enabled jobs ordered by next run.
    fn list_jobs(&self) -> Vec<CronJob>;
    fn remove_job(&self, id: &str) -> bool;
}

/// In-process scheduler persisted to `<data_dir>/cron/jobs.json`.
pub(crate) struct CronService {
    path: Option<PathBuf>,
    jobs: Mutex<Vec<CronJob>>,
    counter: AtomicU64,
}

impl CronService {
    pub(crate) fn open(path: &Path) -> Result<Self, String> {
        let jobs = match fs::read_to_string(path) {
            Ok(raw) if !raw.trim().is_empty() => {
                serde_json::from_str::<JobFile>(&raw)
                    .map_err(|e| format!("parse {}: {e}", path.display()))?
                    .jobs
            }
            _ => Vec::new(),
        };
        tracing::debug!(target: "scheduler", path = %path.display(), jobs = jobs.len(), "loaded jobs");
        Ok(Self {
            path: Some(path.to_path_buf()),
            jobs: Mutex::new(jobs),
            counter: AtomicU64::new(0),
        })
    }

    pub(crate) fn in_memory() -> Self {
        Self {
            path: None,
            jobs: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }

    pub(crate) fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join("cron").join(JOBS_FILE)
    }

    fn next_id(&self, name: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let seed = format!("{name}:{}:{n}:{}", now_ms(), std::process::id());
        blake3::hash(seed.as_bytes()).to_hex()[..8].to_string()
    }

    fn persist(&self, jobs: &[CronJob]) -> Result<(), String> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("create cron dir: {e}"))?;
        }
        let body = serde_json::to_string_pretty(&serde_json::json!({ "jobs": jobs }))
            .map_err(|e| format!("encode jobs: {e}"))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body).map_err(|e| format!("write jobs: {e}"))?;
        fs::rename(&tmp, path).map_err(|e| format!("replace jobs: {e}"))
    }

    /// Take every job due at `now_ms`, advancing or retiring it, and persist the result.
    pub(crate) fn take_due(&self, now_ms: i64) -> Vec<CronJob> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut due = Vec::new();
        for job in jobs.iter_mut() {
            let Some(next) = job.next_run_at_ms else { continue };
            if !job.enabled || next > now_ms {
                continue;
            }
            job.last_run_at_ms = Some(now_ms);
            job.next_run_at_ms = match job.schedule {
                JobSchedule::Every { every_ms } if every_ms > 0 => Some(now_ms.saturating_add(every_ms)),
                _ => None,
            };
            if job.next_run_at_ms.is_none() {
                job.enabled = false;
            }
            due.push(job.clone());
        }
        if due.is_empty() {
            return due;
        }
        jobs.retain(|job| job.enabled || !job.delete_after_run);
        if let Err(e) = self.persist(&jobs) {
            tracing::warn!(target: "scheduler", error = %e, "failed to persist jobs");
        }
        due
    }

    /// Poll for due jobs until `running` goes false; each due job goes to `on_job`.
    pub(crate) fn spawn_ticker<F>(
        self: Arc<Self>,
        running: Arc<AtomicBool>,
        on_job: F,
    ) -> Option<thread::JoinHandle<()>>
    where
        F: Fn(CronJob) + Send + 'static,
    {
        thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    for job in self.take_due(now_ms()) {
                        tracing::info!(target: "scheduler", id = %job.id, name = %job.name, "job due");
                        on_job(job);
                    }
                    thread::sleep(TICK_INTERVAL);
                }
            })
            .map_err(|e| tracing::warn!(target: "scheduler", error = %e, "could not spawn ticker"))
            .ok()
    }
}

impl Scheduler for CronService {
    fn add_job(
        &self,
        name: &str,
        schedule: JobSchedule,
        payload: JobPayload,
        delete_after_run: bool,
    ) -> Result<CronJob, String> {
        let now = now_ms();
        let next_run_at_ms = match schedule {
            JobSchedule::At { at_ms } => Some(at_ms),
            JobSchedule::Every { every_ms } if every_ms > 0 => Some(now.saturating_add(every_ms)),
            JobSchedule::Every { .. } => return Err("interval must be positive".into()),
        };
        let job = CronJob {
            id: self.next_id(name),
            name: name.to_string(),
            schedule,
            payload,
            next_run_at_ms,
            last_run_at_ms: None,
            delete_after_run,
            enabled: true,
            created_at_ms: now,
        };
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.push(job.clone());
        self.persist(&jobs)?;
        tracing::info!(target: "scheduler", id = %job.id, name = %job.name, next = ?job.next_run_at_ms, "job added");
        Ok(job)
    }

    fn list_jobs(&self) -> Vec<CronJob> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<CronJob> = jobs.iter().filter(|j| j.enabled).cloned().collect();
        out.sort_by_key(|j| j.next_run_at_ms.unwrap_or(i64::MAX));
        out
    }

    fn remove_job(&self, id: &str) -> bool {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        let removed = jobs.len() != before;
        if removed {
            if let Err(e) = self.persist(&jobs) {
                tracing::warn!(target: "scheduler", error = %e, "failed to persist jobs");
            }
        }
        removed
    }
}

/// Schedule a one-shot reminder delivered straight to `channel:chat_id`.
pub(crate) fn schedule_reminder(
    scheduler: &dyn Scheduler,
    message: &str,
    at_ms: i64,
    channel: &str,
    chat_id: &str,
) -> Result<CronJob, String> {
    let short: String = message.chars().take(30).collect();
    let name = if message.chars().count() > 30 {
        format!("Reminder: {short}...")
    } else {
        format!("Reminder: {short}")
    };
    scheduler.add_job(
        &name,
        JobSchedule::At { at_ms },
        JobPayload {
            kind: PayloadKind::SystemEvent,
            message: message.to_string(),
            deliver: true,
            channel: Some(channel.to_string()),
            to: Some(chat_id.to_string()),
        },
        true,
    )
}
