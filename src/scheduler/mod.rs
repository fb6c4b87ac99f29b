//! Two-lane cooperative task scheduler.
//!
//! Each [`Affinity`] owns one dedicated OS thread. Immediate tasks run on
//! their lane in FIFO order; timer tasks live in a single queue shared by both
//! lanes and are handed to their lane once due, in fire-time order.
//!
//! Lanes never spawn per-task threads. A lane runs at most `max_slice`
//! immediate tasks and `max_slice` timers per iteration, then sleeps until new
//! work arrives, the next timer is due, or `idle_wait` elapses.

mod task;

pub use task::{Repeat, TaskHandle, TaskId, TimerHandle};

use std::cell::Cell;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use task::{Job, RecurringJob, panic_message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Affinity {
    Background,
    User,
}

impl Affinity {
    const ALL: [Affinity; 2] = [Affinity::Background, Affinity::User];

    fn lane(self) -> usize {
        match self {
            Affinity::Background => 0,
            Affinity::User => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Affinity::Background => "background",
            Affinity::User => "user",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on tasks (and separately timers) run per lane iteration.
    pub max_slice: usize,
    /// Longest a lane sleeps without new work.
    pub idle_wait_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_slice: 10,
            idle_wait_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Uninitialized,
    Running,
    Terminated,
}

struct QueuedTask {
    id: TaskId,
    job: Job,
}

struct TimerEntry {
    id: TaskId,
    affinity: Affinity,
    period: Duration,
    repeat: Repeat,
    job: RecurringJob,
    done: oneshot::Sender<Result<()>>,
}

struct Queues {
    status: Status,
    tasks: [VecDeque<QueuedTask>; 2],
    due: [VecDeque<TimerEntry>; 2],
    timers: BTreeMap<(Instant, u64), TimerEntry>,
    running_timers: HashSet<TaskId>,
    cancelled: HashSet<TaskId>,
}

impl Queues {
    fn next_fire(&self) -> Option<Instant> {
        self.timers.keys().next().map(|(at, _)| *at)
    }
}

/// Dropped outside the lock; dropping a job resolves its handle as cancelled.
#[derive(Default)]
struct Discarded {
    tasks: Vec<QueuedTask>,
    timers: Vec<TimerEntry>,
}

thread_local! {
    static CURRENT_LANE: Cell<Option<(u64, Affinity)>> = const { Cell::new(None) };
}

static NEXT_SCHEDULER: AtomicU64 = AtomicU64::new(1);

/// Stand-in fire time for delays past what `Instant` can represent.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

fn fire_time(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

pub(crate) struct Shared {
    id: u64,
    config: SchedulerConfig,
    queues: Mutex<Queues>,
    wakeups: [Condvar; 2],
    next_task: AtomicU64,
    next_seq: AtomicU64,
}

impl Shared {
    fn next_id(&self) -> TaskId {
        TaskId(self.next_task.fetch_add(1, Ordering::Relaxed))
    }

    fn current_affinity(&self) -> Option<Affinity> {
        CURRENT_LANE.with(|lane| match lane.get() {
            Some((id, affinity)) if id == self.id => Some(affinity),
            _ => None,
        })
    }

    fn wake_all(&self) {
        for wakeup in &self.wakeups {
            wakeup.notify_all();
        }
    }

    fn insert_timer(&self, queues: &mut Queues, fire_at: Instant, entry: TimerEntry) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        queues.timers.insert((fire_at, seq), entry);
    }

    /// Moves every due timer to its lane, oldest first.
    fn promote_due_timers(&self, queues: &mut Queues, now: Instant) {
        let mut woke_other = [false; 2];
        while let Some(entry) = queues.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let timer = entry.remove();
            let lane = timer.affinity.lane();
            woke_other[lane] = true;
            queues.due[lane].push_back(timer);
        }
        for affinity in Affinity::ALL {
            if woke_other[affinity.lane()] {
                self.wakeups[affinity.lane()].notify_one();
            }
        }
    }

    pub(crate) fn cancel(&self, id: TaskId) -> bool {
        let mut discarded = Discarded::default();
        let found = {
            let mut queues = self.queues.lock();
            let mut found = false;
            for lane in 0..2 {
                if let Some(pos) = queues.tasks[lane].iter().position(|t| t.id == id) {
                    discarded.tasks.extend(queues.tasks[lane].remove(pos));
                    found = true;
                }
                if let Some(pos) = queues.due[lane].iter().position(|t| t.id == id) {
                    discarded.timers.extend(queues.due[lane].remove(pos));
                    found = true;
                }
            }
            if let Some(key) = queues
                .timers
                .iter()
                .find(|(_, timer)| timer.id == id)
                .map(|(key, _)| *key)
            {
                discarded.timers.extend(queues.timers.remove(&key));
                found = true;
            }
            if !found && queues.running_timers.contains(&id) {
                // 正在执行的定时任务：执行完后不再重新入队
                queues.cancelled.insert(id);
                found = true;
            }
            found
        };
        drop(discarded);
        found
    }

    fn cancel_all(&self, queues: &mut Queues) -> Discarded {
        let mut discarded = Discarded::default();
        for lane in 0..2 {
            discarded.tasks.extend(queues.tasks[lane].drain(..));
            discarded.timers.extend(queues.due[lane].drain(..));
        }
        discarded
            .timers
            .extend(std::mem::take(&mut queues.timers).into_values());
        let running: Vec<TaskId> = queues.running_timers.iter().copied().collect();
        queues.cancelled.extend(running);
        discarded
    }
}

/// The two-lane scheduler. Create with [`Scheduler::new`], start with
/// [`Scheduler::init`], stop with [`Scheduler::term`].
pub struct Scheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Set once the first `term` has joined the lanes.
    joined: Mutex<bool>,
    joined_cv: Condvar,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_SCHEDULER.fetch_add(1, Ordering::Relaxed),
                config,
                queues: Mutex::new(Queues {
                    status: Status::Uninitialized,
                    tasks: [VecDeque::new(), VecDeque::new()],
                    due: [VecDeque::new(), VecDeque::new()],
                    timers: BTreeMap::new(),
                    running_timers: HashSet::new(),
                    cancelled: HashSet::new(),
                }),
                wakeups: [Condvar::new(), Condvar::new()],
                next_task: AtomicU64::new(1),
                next_seq: AtomicU64::new(0),
            }),
            threads: Mutex::new(Vec::new()),
            joined: Mutex::new(false),
            joined_cv: Condvar::new(),
        }
    }

    /// Starts one worker thread per lane.
    pub fn init(&self) -> Result<()> {
        {
            let mut queues = self.shared.queues.lock();
            match queues.status {
                Status::Running => return Err(Error::AlreadyRunning),
                Status::Terminated => {
                    return Err(Error::InvalidState("scheduler has been terminated".into()));
                }
                Status::Uninitialized => queues.status = Status::Running,
            }
        }

        let mut threads = self.threads.lock();
        for affinity in Affinity::ALL {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("speech-{}", affinity.name()))
                .spawn(move || run_lane(shared, affinity))?;
            threads.push(handle);
        }
        log::info!("scheduler started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.queues.lock().status == Status::Running
    }

    fn submit(&self, affinity: Affinity, task: QueuedTask) -> Result<()> {
        let mut queues = self.shared.queues.lock();
        if queues.status != Status::Running {
            return Err(Error::InvalidState("scheduler is not running".into()));
        }
        queues.tasks[affinity.lane()].push_back(task);
        self.shared.wakeups[affinity.lane()].notify_one();
        Ok(())
    }

    /// Queues `task` on the given lane.
    pub fn execute<F, R>(&self, task: F, affinity: Affinity) -> Result<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let id = self.shared.next_id();
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(task)).map_err(|payload| {
                let message = panic_message(payload);
                log::error!("scheduled task panicked: {}", message);
                Error::TaskFailed(message)
            });
            let _ = tx.send(result);
        });
        self.submit(affinity, QueuedTask { id, job })?;
        Ok(TaskHandle::new(id, rx))
    }

    /// Runs `task` on the given lane and waits for its result. Calling this
    /// from the target lane itself would deadlock and is rejected.
    pub fn execute_sync<F, R>(&self, task: F, affinity: Affinity) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.shared.current_affinity() == Some(affinity) {
            return Err(Error::Abort(format!(
                "synchronous execution requested from the {} lane itself",
                affinity.name()
            )));
        }
        self.execute(task, affinity)?.wait()
    }

    /// Runs `task` after `delay`, then every `delay` while the repeat budget
    /// lasts.
    pub fn execute_after<F>(
        &self,
        task: F,
        delay: Duration,
        repeat: Repeat,
        affinity: Affinity,
    ) -> Result<TimerHandle>
    where
        F: FnMut() + Send + 'static,
    {
        if repeat == Repeat::Times(0) {
            return Err(Error::RuntimeError("repeat count must be at least 1".into()));
        }

        let id = self.shared.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut queues = self.shared.queues.lock();
            if queues.status != Status::Running {
                return Err(Error::InvalidState("scheduler is not running".into()));
            }
            let entry = TimerEntry {
                id,
                affinity,
                period: delay,
                repeat,
                job: Box::new(task),
                done: tx,
            };
            self.shared.insert_timer(&mut queues, fire_time(Instant::now(), delay), entry);
        }
        self.shared.wake_all();
        Ok(TimerHandle::new(
            TaskHandle::new(id, rx),
            Arc::downgrade(&self.shared),
        ))
    }

    /// Removes a queued task or timer. A timer that is executing right now
    /// finishes its current run and is not rescheduled.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.shared.cancel(id)
    }

    /// Drops every queued task and timer; their handles resolve `Cancelled`.
    pub fn cancel_all(&self) {
        let discarded = {
            let mut queues = self.shared.queues.lock();
            self.shared.cancel_all(&mut queues)
        };
        drop(discarded);
    }

    pub fn is_on_service_thread(&self) -> bool {
        self.shared.current_affinity().is_some()
    }

    pub fn current_affinity(&self) -> Option<Affinity> {
        self.shared.current_affinity()
    }

    /// Stops the scheduler: pending work is cancelled, in-flight tasks finish,
    /// and worker threads are joined (except the calling one). Idempotent.
    pub fn term(&self) -> Result<()> {
        if self.shared.current_affinity() == Some(Affinity::Background) {
            return Err(Error::Abort(
                "scheduler cannot be terminated from its background lane".into(),
            ));
        }
        self.stop();
        Ok(())
    }

    fn stop(&self) {
        let discarded = {
            let mut queues = self.shared.queues.lock();
            if queues.status == Status::Terminated {
                None
            } else {
                queues.status = Status::Terminated;
                Some(self.shared.cancel_all(&mut queues))
            }
        };
        let Some(discarded) = discarded else {
            self.wait_joined();
            return;
        };
        self.shared.wake_all();
        let cancelled = discarded.tasks.len() + discarded.timers.len();
        drop(discarded);

        let current = thread::current().id();
        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.thread().id() == current {
                // 在自身线程上停止时不能 join 自己
                continue;
            }
            if handle.join().is_err() {
                log::error!("scheduler lane thread panicked");
            }
        }
        *self.joined.lock() = true;
        self.joined_cv.notify_all();
        log::info!("scheduler terminated ({} pending tasks cancelled)", cancelled);
    }

    /// Blocks a later `term` until the first one has joined the lanes. A lane
    /// thread never waits, since the first caller may be joining it.
    fn wait_joined(&self) {
        if self.shared.current_affinity().is_some() {
            return;
        }
        let mut joined = self.joined.lock();
        while !*joined {
            self.joined_cv.wait(&mut joined);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_lane(shared: Arc<Shared>, affinity: Affinity) {
    CURRENT_LANE.with(|lane| lane.set(Some((shared.id, affinity))));
    let lane = affinity.lane();
    let max_slice = shared.config.max_slice.max(1);
    let idle_wait = Duration::from_millis(shared.config.idle_wait_ms);
    log::debug!("{} lane started", affinity.name());

    let mut queues = shared.queues.lock();
    loop {
        if queues.status == Status::Terminated {
            break;
        }

        let now = Instant::now();
        shared.promote_due_timers(&mut queues, now);

        let take = queues.tasks[lane].len().min(max_slice);
        let tasks: Vec<QueuedTask> = queues.tasks[lane].drain(..take).collect();
        let take = queues.due[lane].len().min(max_slice);
        let timers: Vec<TimerEntry> = queues.due[lane].drain(..take).collect();

        if tasks.is_empty() && timers.is_empty() {
            let wait = queues
                .next_fire()
                .map(|at| at.saturating_duration_since(now).min(idle_wait))
                .unwrap_or(idle_wait);
            shared.wakeups[lane].wait_for(&mut queues, wait);
            continue;
        }

        for timer in &timers {
            queues.running_timers.insert(timer.id);
        }
        drop(queues);

        for task in tasks {
            (task.job)();
        }

        let mut finished = Vec::with_capacity(timers.len());
        for mut timer in timers {
            let outcome = catch_unwind(AssertUnwindSafe(|| (timer.job)()));
            finished.push((timer, outcome.map_err(panic_message)));
        }

        queues = shared.queues.lock();
        let mut completed = Vec::new();
        for (timer, outcome) in finished {
            queues.running_timers.remove(&timer.id);
            let cancelled = queues.cancelled.remove(&timer.id);
            match outcome {
                Err(message) => {
                    log::error!("timer task {:?} panicked: {}", timer.id, message);
                    completed.push((timer.done, Err(Error::TaskFailed(message))));
                }
                Ok(()) if cancelled || queues.status != Status::Running => {
                    completed.push((timer.done, Err(Error::Cancelled)));
                }
                Ok(()) => match timer.repeat.after_run() {
                    Some(repeat) => {
                        let fire_at = fire_time(Instant::now(), timer.period);
                        let entry = TimerEntry { repeat, ..timer };
                        shared.insert_timer(&mut queues, fire_at, entry);
                    }
                    None => completed.push((timer.done, Ok(()))),
                },
            }
        }
        for (done, result) in completed {
            let _ = done.send(result);
        }
    }
    drop(queues);
    log::debug!("{} lane stopped", affinity.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn started() -> Scheduler {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        scheduler.init().unwrap();
        scheduler
    }

    #[test]
    fn test_lifecycle() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        assert!(scheduler.execute(|| 1, Affinity::User).is_err());
        scheduler.init().unwrap();
        assert!(matches!(scheduler.init(), Err(Error::AlreadyRunning)));
        scheduler.term().unwrap();
        scheduler.term().unwrap();
        assert!(matches!(scheduler.init(), Err(Error::InvalidState(_))));
        assert!(matches!(
            scheduler.execute(|| 1, Affinity::Background),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_fifo_per_lane() {
        let scheduler = started();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..50 {
            let order = order.clone();
            handles.push(
                scheduler
                    .execute(move || order.lock().push(i), Affinity::Background)
                    .unwrap(),
            );
        }
        for handle in handles {
            handle.wait().unwrap();
        }
        assert_eq!(*order.lock(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_lanes_are_independent() {
        let scheduler = Arc::new(started());
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let blocked = scheduler
            .execute(
                move || {
                    let _ = release_rx.recv_timeout(Duration::from_secs(5));
                },
                Affinity::User,
            )
            .unwrap();

        // User 线程被阻塞时 Background 仍然可以执行
        let value = scheduler.execute(|| 42, Affinity::Background).unwrap().wait();
        assert_eq!(value.unwrap(), 42);
        release_tx.send(()).unwrap();
        blocked.wait().unwrap();
    }

    #[test]
    fn test_panic_is_reported() {
        let scheduler = started();
        let failed = scheduler
            .execute(|| -> u32 { panic!("boom") }, Affinity::Background)
            .unwrap();
        assert!(matches!(failed.wait(), Err(Error::TaskFailed(msg)) if msg == "boom"));

        // lane keeps going
        let ok = scheduler.execute(|| "still alive", Affinity::Background).unwrap();
        assert_eq!(ok.wait().unwrap(), "still alive");
    }

    #[test]
    fn test_timers_fire_in_order() {
        let scheduler = started();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (label, delay_ms, affinity) in [
            ("c", 60, Affinity::User),
            ("a", 20, Affinity::Background),
            ("b", 40, Affinity::Background),
        ] {
            let order = order.clone();
            handles.push(
                scheduler
                    .execute_after(
                        move || order.lock().push(label),
                        Duration::from_millis(delay_ms),
                        Repeat::once(),
                        affinity,
                    )
                    .unwrap(),
            );
        }
        for handle in handles {
            handle.completion().wait().unwrap();
        }
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_timer_not_early() {
        let scheduler = started();
        let start = Instant::now();
        let fired_at = Arc::new(Mutex::new(None));
        let slot = fired_at.clone();
        scheduler
            .execute_after(
                move || *slot.lock() = Some(Instant::now()),
                Duration::from_millis(50),
                Repeat::once(),
                Affinity::User,
            )
            .unwrap()
            .completion()
            .wait()
            .unwrap();
        let fired = fired_at.lock().unwrap();
        assert!(fired.duration_since(start) >= Duration::from_millis(50));
    }

    #[test]
    fn test_recurring_timer_runs_repeat_count() {
        let scheduler = started();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        scheduler
            .execute_after(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_millis(5),
                Repeat::Times(3),
                Affinity::Background,
            )
            .unwrap()
            .completion()
            .wait()
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cancel_forever_timer() {
        let scheduler = started();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let timer = scheduler
            .execute_after(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_millis(5),
                Repeat::Forever,
                Affinity::User,
            )
            .unwrap();
        while count.load(Ordering::SeqCst) < 2 {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(timer.cancel());
        assert!(matches!(timer.completion().wait(), Err(Error::Cancelled)));
        let seen = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_term_cancels_pending_timers() {
        let scheduler = started();
        let timer = scheduler
            .execute_after(|| {}, Duration::from_secs(60), Repeat::once(), Affinity::User)
            .unwrap();
        scheduler.term().unwrap();
        assert!(matches!(timer.completion().wait(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_huge_delay_never_fires() {
        let scheduler = started();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = scheduler
            .execute_after(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                Duration::MAX,
                Repeat::once(),
                Affinity::Background,
            )
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(timer.cancel());

        let mut pending = scheduler
            .execute_after(|| {}, Duration::from_secs(60), Repeat::once(), Affinity::User)
            .unwrap()
            .completion();
        scheduler.term().unwrap();
        assert!(matches!(pending.wait_timeout(Duration::MAX), Err(Error::Cancelled)));
    }

    #[test]
    fn test_execute_sync_on_same_lane_aborts() {
        let scheduler = Arc::new(started());
        let inner = scheduler.clone();
        let result = scheduler
            .execute(
                move || inner.execute_sync(|| 1, Affinity::User),
                Affinity::User,
            )
            .unwrap()
            .wait()
            .unwrap();
        assert!(matches!(result, Err(Error::Abort(_))));

        let other = scheduler.execute_sync(|| 2, Affinity::User).unwrap();
        assert_eq!(other, 2);
    }

    #[test]
    fn test_term_from_background_lane_aborts() {
        let scheduler = Arc::new(started());
        let inner = scheduler.clone();
        let result = scheduler
            .execute(move || inner.term(), Affinity::Background)
            .unwrap()
            .wait()
            .unwrap();
        assert!(matches!(result, Err(Error::Abort(_))));
        assert!(scheduler.is_running());
    }

    #[test]
    fn test_service_thread_detection() {
        let scheduler = Arc::new(started());
        assert!(!scheduler.is_on_service_thread());
        let inner = scheduler.clone();
        let affinity = scheduler
            .execute(move || inner.current_affinity(), Affinity::User)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(affinity, Some(Affinity::User));
    }

    #[tokio::test]
    async fn test_handle_is_a_future() {
        let scheduler = started();
        let value = scheduler.execute(|| 7 * 6, Affinity::Background).unwrap().await;
        assert_eq!(value.unwrap(), 42);
    }
}
