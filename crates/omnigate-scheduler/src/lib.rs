//! Singleton cron + interval job registry.
//!
//! Jobs are registered by id and replaceable in place: re-registering an id
//! aborts the prior task and keeps exactly one active trigger. Cron
//! schedules evaluate in the configured application timezone; interval jobs
//! tick on the tokio clock. The scheduler does not deduplicate across
//! processes; jobs needing that take an advisory lock themselves.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

#[derive(Clone)]
pub enum Schedule {
    Interval(Duration),
    Cron(cron::Schedule),
}

impl Schedule {
    pub fn cron(expression: &str) -> Result<Self, cron::error::Error> {
        Ok(Schedule::Cron(cron::Schedule::from_str(expression)?))
    }

    fn next_fire_in(&self, timezone: Tz) -> Option<Duration> {
        match self {
            Schedule::Interval(interval) => Some(*interval),
            Schedule::Cron(schedule) => {
                let next = schedule.upcoming(timezone).next()?;
                let delta = next.with_timezone(&Utc) - Utc::now();
                delta.to_std().ok()
            }
        }
    }
}

struct Job {
    name: String,
    schedule: Schedule,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: String,
    pub name: String,
    pub next_fire_in: Option<Duration>,
}

pub struct Scheduler {
    timezone: Tz,
    jobs: Mutex<HashMap<String, Job>>,
}

impl Scheduler {
    pub fn new(timezone_name: &str) -> Self {
        let timezone: Tz = timezone_name.parse().unwrap_or_else(|_| {
            warn!(timezone = timezone_name, "unknown timezone, falling back to UTC");
            chrono_tz::UTC
        });
        Self {
            timezone,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Register or replace a job. The prior trigger, if any, is aborted.
    pub fn register(&self, id: &str, name: &str, schedule: Schedule, job: JobFn) {
        let timezone = self.timezone;
        let loop_schedule = schedule.clone();
        let job_id = id.to_string();
        let handle = tokio::spawn(async move {
            loop {
                let Some(wait) = loop_schedule.next_fire_in(timezone) else {
                    error!(job_id = %job_id, "schedule yields no future fire time, stopping");
                    break;
                };
                tokio::time::sleep(wait).await;
                job().await;
            }
        });

        let mut jobs = self.jobs.lock().expect("scheduler lock poisoned");
        if let Some(previous) = jobs.insert(
            id.to_string(),
            Job {
                name: name.to_string(),
                schedule,
                handle,
            },
        ) {
            previous.handle.abort();
            info!(job_id = id, "replaced scheduled job");
        } else {
            info!(job_id = id, job_name = name, "registered scheduled job");
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut jobs = self.jobs.lock().expect("scheduler lock poisoned");
        match jobs.remove(id) {
            Some(job) => {
                job.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn next_fire_in(&self, id: &str) -> Option<Duration> {
        let jobs = self.jobs.lock().expect("scheduler lock poisoned");
        jobs.get(id)?.schedule.next_fire_in(self.timezone)
    }

    pub fn list(&self) -> Vec<JobInfo> {
        let jobs = self.jobs.lock().expect("scheduler lock poisoned");
        let mut infos: Vec<JobInfo> = jobs
            .iter()
            .map(|(id, job)| JobInfo {
                id: id.clone(),
                name: job.name.clone(),
                next_fire_in: job.schedule.next_fire_in(self.timezone),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn shutdown(&self) {
        let mut jobs = self.jobs.lock().expect("scheduler lock poisoned");
        for (_, job) in jobs.drain() {
            job.handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_job(counter: Arc<AtomicUsize>) -> JobFn {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn interval_job_fires_repeatedly() {
        let scheduler = Scheduler::new("UTC");
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.register(
            "tick",
            "tick job",
            Schedule::Interval(Duration::from_millis(20)),
            counter_job(counter.clone()),
        );
        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(counter.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn reregistering_replaces_the_trigger() {
        let scheduler = Scheduler::new("UTC");
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        scheduler.register(
            "job",
            "first",
            Schedule::Interval(Duration::from_millis(10)),
            counter_job(first.clone()),
        );
        scheduler.register(
            "job",
            "second",
            Schedule::Interval(Duration::from_millis(10)),
            counter_job(second.clone()),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;

        let first_count = first.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        // The replaced job stopped; the replacement keeps firing.
        assert_eq!(first.load(Ordering::SeqCst), first_count);
        assert!(second.load(Ordering::SeqCst) >= 3);
        assert_eq!(scheduler.list().len(), 1);
        assert_eq!(scheduler.list()[0].name, "second");
    }

    #[tokio::test]
    async fn removed_jobs_stop_firing() {
        let scheduler = Scheduler::new("UTC");
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.register(
            "job",
            "job",
            Schedule::Interval(Duration::from_millis(10)),
            counter_job(counter.clone()),
        );
        assert!(scheduler.remove("job"));
        let seen = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), seen);
        assert!(!scheduler.remove("job"));
    }

    #[test]
    fn cron_schedules_report_next_fire() {
        let schedule = Schedule::cron("0 0 3 * * * *").unwrap();
        assert!(schedule.next_fire_in(chrono_tz::UTC).is_some());
    }
}
