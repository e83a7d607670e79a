//! Daily schedulers that drive rotation.
//!
//! A [`Scheduler`] is anything that can run a callback once per calendar day.
//! [`RotateFile`](crate::RotateFile) registers exactly one callback with its
//! scheduler, lazily, on the first write. Two implementations ship with the
//! crate:
//!
//! * [`DailyScheduler`] owns a background thread that fires every registered
//!   job when the calendar date advances (midnight in its time zone).
//! * [`ManualScheduler`] fires only when [`ManualScheduler::fire`] is called,
//!   which is how external triggers and tests drive rotation.
use {
    crate::TimeZone,
    chrono::{DateTime, FixedOffset, NaiveDate},
    once_cell::sync::Lazy,
    parking_lot::{Condvar, Mutex},
    std::{
        collections::HashMap,
        panic::{self, AssertUnwindSafe},
        sync::Arc,
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// What a job wants after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Run again tomorrow.
    Keep,
    /// Remove the job; its target is gone.
    Retire,
}

/// A callback registered to run once per day.
pub type DailyJob = Box<dyn Fn() -> JobStatus + Send + Sync + 'static>;

type SharedJob = Arc<dyn Fn() -> JobStatus + Send + Sync + 'static>;

type Clock = Box<dyn Fn() -> DateTime<FixedOffset> + Send + Sync + 'static>;

/// Upper bound on a single sleep of the [`DailyScheduler`] worker, so that
/// wall-clock adjustments are picked up without waiting a whole day.
const MAX_WAIT: Duration = Duration::from_secs(60);

static SHARED: Lazy<Mutex<HashMap<TimeZone, Arc<DailyScheduler>>>> = Lazy::new(Default::default);

/// Returns the process-wide [`DailyScheduler`] for the local time zone.
pub fn shared_scheduler() -> Arc<DailyScheduler> {
    shared_scheduler_for(TimeZone::Local)
}

/// Returns the process-wide [`DailyScheduler`] whose days start at midnight in
/// `time_zone`, starting it on first use.
///
/// Writers built without an explicit scheduler register with the instance for
/// their own time zone, so the archive date and the firing midnight agree.
/// Shared instances live until the process exits.
pub fn shared_scheduler_for(time_zone: TimeZone) -> Arc<DailyScheduler> {
    let mut shared = SHARED.lock();
    let scheduler = shared
        .entry(time_zone)
        .or_insert_with(|| Arc::new(DailyScheduler::start(time_zone)));
    Arc::clone(scheduler)
}

/// A facility that invokes registered callbacks once per calendar day.
pub trait Scheduler: Send + Sync {
    /// Register `job` to be invoked once per day, asynchronously with respect
    /// to the caller, until it returns [`JobStatus::Retire`].
    fn register_daily(&self, job: DailyJob);
}

/// The registered jobs of a scheduler.
///
/// Jobs are snapshotted before they run so the list lock is never held while a
/// job executes. A job usually takes a writer lock, and a writer registers
/// while holding that same lock.
#[derive(Default)]
struct JobList {
    jobs: Mutex<Vec<SharedJob>>,
}

impl JobList {
    fn push(&self, job: DailyJob) {
        self.jobs.lock().push(Arc::from(job));
    }

    fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    fn run_all(&self) {
        let snapshot: Vec<SharedJob> = self.jobs.lock().clone();
        let mut retired = Vec::new();
        for job in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| job())) {
                Ok(JobStatus::Keep) => {}
                Ok(JobStatus::Retire) => retired.push(job),
                Err(_) => tracing::error!("daily job panicked; continuing with remaining jobs"),
            }
        }
        if !retired.is_empty() {
            self.jobs
                .lock()
                .retain(|job| !retired.iter().any(|gone| same_job(job, gone)));
        }
    }
}

fn same_job(a: &SharedJob, b: &SharedJob) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// A [`Scheduler`] backed by one background thread firing at midnight.
///
/// The worker sleeps until the next midnight of its time zone (never longer
/// than a minute at a time) and runs every registered job whenever the
/// calendar date has moved past the last date it observed. An early wake-up
/// therefore never fires, and a clock that jumps backwards does not fire twice.
///
/// # Examples
/// ```
/// use {
///     rotatefile::{DailyScheduler, RotateFileBuilder, TimeZone},
///     std::sync::Arc,
/// };
///
/// let scheduler = Arc::new(DailyScheduler::start(TimeZone::UTC));
/// let writer = RotateFileBuilder::new("./logs/app.log")
///     .time_zone(TimeZone::UTC)
///     .scheduler(scheduler.clone())
///     .build();
/// # drop(writer);
/// scheduler.shutdown();
/// ```
pub struct DailyScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    jobs: JobList,
    time_zone: TimeZone,
    now: Clock,
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl DailyScheduler {
    /// Start a scheduler whose days begin at midnight in `time_zone`.
    pub fn start(time_zone: TimeZone) -> Self {
        Self::start_with_clock(time_zone, Box::new(move || time_zone.now()))
    }

    fn start_with_clock(time_zone: TimeZone, now: Clock) -> Self {
        let shared = Arc::new(Shared {
            jobs: JobList::default(),
            time_zone,
            now,
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("rotatefile-daily".to_string())
            .spawn(move || worker_shared.run());
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::error!(error = %err, "failed to spawn daily scheduler thread; daily rotation disabled");
                None
            }
        };
        DailyScheduler {
            shared,
            worker: Mutex::new(worker),
        }
    }

    /// Stop the worker thread and wait for it to exit. Idempotent.
    ///
    /// A job that is running when this is called finishes first.
    pub fn shutdown(&self) {
        *self.shared.stopped.lock() = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("daily scheduler thread panicked");
            }
        }
    }

    /// Number of live registered jobs.
    pub fn registrations(&self) -> usize {
        self.shared.jobs.len()
    }

    /// The time zone whose midnight starts a new day.
    pub fn time_zone(&self) -> TimeZone {
        self.shared.time_zone
    }
}

impl Scheduler for DailyScheduler {
    fn register_daily(&self, job: DailyJob) {
        self.shared.jobs.push(job);
    }
}

impl Drop for DailyScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn run(&self) {
        let mut last_date = (self.now)().date_naive();
        loop {
            let now = (self.now)();
            if date_advanced(&mut last_date, now) {
                self.jobs.run_all();
                continue;
            }

            let mut stopped = self.stopped.lock();
            if *stopped {
                return;
            }
            self.wake.wait_for(&mut stopped, until_next_midnight(now));
            if *stopped {
                return;
            }
        }
    }
}

/// Record `now`'s date and report whether it is later than `last_date`.
fn date_advanced(last_date: &mut NaiveDate, now: DateTime<FixedOffset>) -> bool {
    let today = now.date_naive();
    if today > *last_date {
        *last_date = today;
        return true;
    }
    false
}

/// Time left until the next midnight at `now`'s offset, capped at [`MAX_WAIT`].
fn until_next_midnight(now: DateTime<FixedOffset>) -> Duration {
    now.date_naive()
        .succ_opt()
        .and_then(|tomorrow| tomorrow.and_hms_opt(0, 0, 0))
        .and_then(|midnight| midnight.and_local_timezone(*now.offset()).single())
        .and_then(|midnight| (midnight - now).to_std().ok())
        .map_or(MAX_WAIT, |wait| wait.min(MAX_WAIT))
}

/// A [`Scheduler`] that fires only on demand.
///
/// Useful to rotate on an external trigger (a signal handler, an admin
/// endpoint) instead of the wall clock, and to drive rotation in tests.
#[derive(Default)]
pub struct ManualScheduler {
    jobs: JobList,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every registered job on the calling thread.
    pub fn fire(&self) {
        self.jobs.run_all();
    }

    /// Number of live registered jobs.
    pub fn registrations(&self) -> usize {
        self.jobs.len()
    }
}

impl Scheduler for ManualScheduler {
    fn register_daily(&self, job: DailyJob) {
        self.jobs.push(job);
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        chrono::TimeZone as _,
        pretty_assertions::assert_eq,
        std::{
            sync::atomic::{AtomicUsize, Ordering},
            time::Instant,
        },
    };

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(y, m, d, h, min, s)
            .unwrap()
    }

    fn counting_job(hits: &Arc<AtomicUsize>) -> DailyJob {
        let hits = Arc::clone(hits);
        Box::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
            JobStatus::Keep
        })
    }

    /// Poll `cond` for up to five seconds.
    fn eventually(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn wait_is_capped_far_from_midnight() {
        assert_eq!(until_next_midnight(at(2024, 3, 15, 12, 0, 0)), MAX_WAIT);
    }

    #[test]
    fn wait_runs_to_midnight_when_close() {
        assert_eq!(until_next_midnight(at(2024, 3, 15, 23, 59, 30)), Duration::from_secs(30));
        assert_eq!(until_next_midnight(at(2024, 12, 31, 23, 59, 59)), Duration::from_secs(1));
    }

    #[test]
    fn date_advance_fires_once_per_day() {
        let mut last = NaiveDate::from_ymd_opt(2024, 3, 14).unwrap();
        assert!(!date_advanced(&mut last, at(2024, 3, 14, 23, 59, 59)));
        assert!(date_advanced(&mut last, at(2024, 3, 15, 0, 0, 0)));
        assert!(!date_advanced(&mut last, at(2024, 3, 15, 0, 0, 1)));
        // clock stepped backwards
        assert!(!date_advanced(&mut last, at(2024, 3, 14, 23, 0, 0)));
        assert_eq!(last, NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
    }

    #[test]
    fn worker_fires_once_when_the_date_changes() {
        let clock = Arc::new(Mutex::new(at(2024, 3, 14, 23, 59, 59)));
        let reader = Arc::clone(&clock);
        let scheduler = DailyScheduler::start_with_clock(TimeZone::UTC, Box::new(move || *reader.lock()));
        let hits = Arc::new(AtomicUsize::new(0));
        scheduler.register_daily(counting_job(&hits));

        thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        *clock.lock() = at(2024, 3, 15, 0, 0, 1);
        assert!(eventually(|| hits.load(Ordering::SeqCst) == 1));
        thread::sleep(Duration::from_millis(1200));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let started = Instant::now();
        scheduler.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn manual_scheduler_runs_every_job() {
        let scheduler = ManualScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            scheduler.register_daily(counting_job(&hits));
        }
        scheduler.fire();
        scheduler.fire();
        assert_eq!(scheduler.registrations(), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn retired_jobs_are_removed() {
        let scheduler = ManualScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        scheduler.register_daily(Box::new(|| JobStatus::Retire));
        scheduler.register_daily(counting_job(&hits));
        scheduler.fire();
        assert_eq!(scheduler.registrations(), 1);
        scheduler.fire();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_job_does_not_stop_the_rest() {
        let scheduler = ManualScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        scheduler.register_daily(Box::new(|| -> JobStatus { panic!("boom") }));
        scheduler.register_daily(counting_job(&hits));
        scheduler.fire();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.registrations(), 2);
    }

    #[test]
    fn job_may_register_while_running() {
        let scheduler = Arc::new(ManualScheduler::new());
        let inner = Arc::clone(&scheduler);
        scheduler.register_daily(Box::new(move || {
            inner.register_daily(Box::new(|| JobStatus::Keep));
            JobStatus::Keep
        }));
        scheduler.fire();
        assert_eq!(scheduler.registrations(), 2);
    }

    #[test]
    fn shared_schedulers_are_keyed_by_time_zone() {
        let nepal = TimeZone::Fix(FixedOffset::east_opt(5 * 3600 + 45 * 60).unwrap());
        let first = shared_scheduler_for(nepal);
        assert!(Arc::ptr_eq(&first, &shared_scheduler_for(nepal)));
        assert_eq!(first.time_zone(), nepal);
        assert_eq!(shared_scheduler().time_zone(), TimeZone::Local);
    }

    #[test]
    fn shutdown_is_prompt_and_idempotent() {
        let scheduler = DailyScheduler::start(TimeZone::UTC);
        scheduler.register_daily(Box::new(|| JobStatus::Keep));
        let started = Instant::now();
        scheduler.shutdown();
        scheduler.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(scheduler.registrations(), 1);
    }
}
