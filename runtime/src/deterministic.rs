//! A deterministic runtime that polls ready tasks in submission order while
//! advancing a virtual clock.
//!
//! Tasks woken for the same virtual instant run in the order their wakes were
//! submitted, and alarms registered for the same deadline fire in registration
//! order. Combined with the seeded RNG exposed by [Context], this makes every
//! run of a simulation reproducible: same seed, same interleaving.
//!
//! # Panics
//!
//! If any task panics, the runtime will panic (and shutdown).
//!
//! # Example
//!
//! ```rust
//! use simbft_runtime::{deterministic, Clock, Runner, Spawner};
//! use std::time::Duration;
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     let child = context.clone().spawn(|context| async move {
//!         context.sleep(Duration::from_millis(50)).await;
//!         "hello"
//!     });
//!     println!("child result: {:?}", child.await);
//! });
//! ```

use crate::{utils::hex, Clock, Handle, Metrics as MetricsTrait, METRICS_PREFIX};
use futures::task::{waker_ref, ArcWake};
use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::{Metric, Registry},
};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use std::{
    collections::{BinaryHeap, VecDeque},
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{self, Poll, Waker},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::trace;

/// Task id reserved for the root task.
const ROOT_TASK: u64 = 0;

/// Task id of the sentinel used to re-enqueue the root task.
const SENTINEL_TASK: u64 = u64::MAX;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct Work {
    label: String,
}

#[derive(Debug)]
struct Metrics {
    tasks_spawned: Family<Work, Counter>,
    tasks_running: Family<Work, Gauge>,
    task_polls: Family<Work, Counter>,
}

impl Metrics {
    fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            tasks_spawned: Family::default(),
            tasks_running: Family::default(),
            task_polls: Family::default(),
        };
        registry.register(
            "tasks_spawned",
            "Total number of tasks spawned",
            metrics.tasks_spawned.clone(),
        );
        registry.register(
            "tasks_running",
            "Number of tasks currently running",
            metrics.tasks_running.clone(),
        );
        registry.register(
            "task_polls",
            "Total number of task polls",
            metrics.task_polls.clone(),
        );
        metrics
    }
}

/// Track the state of the runtime for determinism auditing.
///
/// Two runs that interact with the runtime identically (same task schedule,
/// same RNG draws) produce the same auditor state.
pub struct Auditor {
    hash: Mutex<Vec<u8>>,
}

impl Default for Auditor {
    fn default() -> Self {
        Self {
            hash: Vec::new().into(),
        }
    }
}

impl Auditor {
    fn process_task(&self, task: u64, label: &str) {
        let mut hash = self.hash.lock().unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&*hash);
        hasher.update(b"process_task");
        hasher.update(task.to_be_bytes());
        hasher.update(label.as_bytes());
        *hash = hasher.finalize().to_vec();
    }

    fn rand(&self, method: &str) {
        let mut hash = self.hash.lock().unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&*hash);
        hasher.update(b"rand");
        hasher.update(method.as_bytes());
        *hash = hasher.finalize().to_vec();
    }

    /// Generate a representation of the current state of the runtime.
    ///
    /// This can be used to ensure that logic running on top of the runtime is
    /// interacting deterministically.
    pub fn state(&self) -> String {
        let hash = self.hash.lock().unwrap().clone();
        hex(&hash)
    }
}

struct Task {
    id: u64,
    label: String,

    tasks: Arc<Tasks>,

    future: Mutex<Pin<Box<dyn Future<Output = ()> + Send + 'static>>>,

    completed: Mutex<bool>,
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.tasks.enqueue(arc_self.clone());
    }
}

struct Tasks {
    counter: Mutex<u64>,
    queue: Mutex<VecDeque<Arc<Task>>>,
}

impl Tasks {
    fn register(
        arc_self: &Arc<Self>,
        label: &str,
        future: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
    ) {
        let mut queue = arc_self.queue.lock().unwrap();
        let id = {
            let mut counter = arc_self.counter.lock().unwrap();
            let old = *counter;
            *counter = counter.checked_add(1).expect("task counter overflow");
            old
        };
        queue.push_back(Arc::new(Task {
            id,
            label: label.to_string(),
            future: Mutex::new(future),
            tasks: arc_self.clone(),
            completed: Mutex::new(false),
        }));
    }

    fn enqueue(&self, task: Arc<Task>) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(task);
    }

    fn drain(&self) -> VecDeque<Arc<Task>> {
        let mut queue = self.queue.lock().unwrap();
        let len = queue.len();
        std::mem::replace(&mut *queue, VecDeque::with_capacity(len))
    }

    fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

/// Configuration for the deterministic runtime.
#[derive(Clone)]
pub struct Config {
    /// Seed for the random number generator.
    seed: u64,

    /// The cycle duration determines how much time is advanced after each
    /// iteration of the event loop. This is useful to prevent starvation if
    /// some task never yields.
    cycle: Duration,

    /// If the runtime is still executing at this point of virtual time, panic.
    timeout: Option<Duration>,
}

impl Config {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_cycle(mut self, cycle: Duration) -> Self {
        self.cycle = cycle;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: 42,
            cycle: Duration::from_millis(1),
            timeout: None,
        }
    }
}

struct Executor {
    registry: Mutex<Registry>,
    cycle: Duration,
    deadline: Option<SystemTime>,
    metrics: Arc<Metrics>,
    auditor: Arc<Auditor>,
    rng: Mutex<StdRng>,
    time: Mutex<SystemTime>,
    tasks: Arc<Tasks>,
    alarms: Mutex<u64>,
    sleeping: Mutex<BinaryHeap<Alarm>>,
}

impl Executor {
    fn next_alarm(&self) -> u64 {
        let mut alarms = self.alarms.lock().unwrap();
        let old = *alarms;
        *alarms = alarms.checked_add(1).expect("alarm counter overflow");
        old
    }
}

/// Waker for the root task.
///
/// The root task is not stored inside [Tasks], so the normal `ArcWake`
/// machinery does not apply. When it is woken we push a completed sentinel
/// task into the ready-queue; that guarantees the executor spins a new
/// iteration and polls the real root task right away.
struct RootWaker {
    tasks: Arc<Tasks>,
}

impl ArcWake for RootWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let sentinel = Arc::new(Task {
            id: SENTINEL_TASK,
            label: String::new(),
            tasks: arc_self.tasks.clone(),
            future: Mutex::new(Box::pin(async {})),
            completed: Mutex::new(true),
        });
        arc_self.tasks.enqueue(sentinel);
    }
}

/// Implementation of [crate::Runner] for the deterministic runtime.
pub struct Runner {
    executor: Arc<Executor>,
}

impl Runner {
    /// Initialize a new deterministic runtime with the given configuration.
    pub fn new(cfg: Config) -> Self {
        // Ensure config is valid
        if cfg.timeout.is_some() && cfg.cycle == Duration::default() {
            panic!("cycle duration must be non-zero when timeout is set");
        }

        // Create a new registry
        let mut registry = Registry::default();
        let runtime_registry = registry.sub_registry_with_prefix(METRICS_PREFIX);

        // Initialize runtime
        let metrics = Arc::new(Metrics::init(runtime_registry));
        let start_time = UNIX_EPOCH;
        let deadline = cfg
            .timeout
            .map(|timeout| start_time.checked_add(timeout).expect("timeout overflowed"));
        let executor = Arc::new(Executor {
            registry: Mutex::new(registry),
            cycle: cfg.cycle,
            deadline,
            metrics,
            auditor: Arc::new(Auditor::default()),
            rng: Mutex::new(StdRng::seed_from_u64(cfg.seed)),
            time: Mutex::new(start_time),
            tasks: Arc::new(Tasks {
                queue: Mutex::new(VecDeque::new()),
                counter: Mutex::new(1), // Reserve 0 for the root task
            }),
            alarms: Mutex::new(0),
            sleeping: Mutex::new(BinaryHeap::new()),
        });
        Self { executor }
    }

    /// Initialize a new deterministic runtime with the default configuration
    /// and the provided seed.
    pub fn seeded(seed: u64) -> Self {
        Self::new(Config::default().with_seed(seed))
    }

    /// Initialize a new deterministic runtime with the default configuration
    /// but panic after the given amount of virtual time.
    pub fn timed(timeout: Duration) -> Self {
        Self::new(Config::default().with_timeout(Some(timeout)))
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl crate::Runner for Runner {
    type Context = Context;

    fn start<F, Fut>(self, f: F) -> Fut::Output
    where
        F: FnOnce(Self::Context) -> Fut,
        Fut: Future,
    {
        // Pin root task to the heap
        let context = Context::new(self.executor.clone());
        let mut root = Box::pin(f(context));

        // A waker for the root task
        let root_waker_src = Arc::new(RootWaker {
            tasks: self.executor.tasks.clone(),
        });

        // Process tasks until the root task completes or progress stalls
        let mut iter: u64 = 0;
        loop {
            // Ensure we have not exceeded our deadline
            {
                let current = self.executor.time.lock().unwrap();
                if let Some(deadline) = self.executor.deadline {
                    if *current >= deadline {
                        panic!("runtime timeout");
                    }
                }
            }

            // Snapshot ready tasks, preserving submission order
            let ready = self.executor.tasks.drain();
            trace!(iter, tasks = ready.len(), "starting loop");

            // Poll the root task once per iteration (its waker only enqueues
            // a sentinel, so a pending wake is indistinguishable from a fresh
            // iteration)
            self.executor.auditor.process_task(ROOT_TASK, "");
            {
                let waker = waker_ref(&root_waker_src);
                let mut cx = task::Context::from_waker(&waker);
                self.executor
                    .metrics
                    .task_polls
                    .get_or_create(&Work {
                        label: String::new(),
                    })
                    .inc();
                if let Poll::Ready(output) = root.as_mut().poll(&mut cx) {
                    trace!(id = ROOT_TASK, "root task is complete");
                    return output;
                }
            }

            // Poll ready tasks in submission order
            for task in ready {
                // If task is completed (or is a sentinel), skip it
                if *task.completed.lock().unwrap() {
                    continue;
                }

                // Record task for auditing
                self.executor.auditor.process_task(task.id, &task.label);
                trace!(id = task.id, "processing task");

                // Prepare task for polling
                let waker = waker_ref(&task);
                let mut cx = task::Context::from_waker(&waker);
                let mut future = task.future.lock().unwrap();

                // Record task poll
                self.executor
                    .metrics
                    .task_polls
                    .get_or_create(&Work {
                        label: task.label.clone(),
                    })
                    .inc();

                // Task is re-queued in its `wake_by_ref` implementation as
                // soon as we poll here (regardless of whether it is
                // Pending/Ready)
                if future.as_mut().poll(&mut cx).is_pending() {
                    trace!(id = task.id, "task is still pending");
                    continue;
                }

                // Mark task as completed
                drop(future);
                *task.completed.lock().unwrap() = true;
                trace!(id = task.id, "task is complete");
            }

            // Advance time by cycle
            //
            // This prevents starvation if some task never yields (to
            // approximate a pure event queue, set the cycle to zero)
            let mut current;
            {
                let mut time = self.executor.time.lock().unwrap();
                *time = time
                    .checked_add(self.executor.cycle)
                    .expect("executor time overflowed");
                current = *time;
            }

            // Skip time if there is nothing ready to run
            if self.executor.tasks.len() == 0 {
                let skip = {
                    let sleeping = self.executor.sleeping.lock().unwrap();
                    match sleeping.peek() {
                        Some(next) if next.time > current => Some(next.time),
                        _ => None,
                    }
                };
                if let Some(skip) = skip {
                    let mut time = self.executor.time.lock().unwrap();
                    *time = skip;
                    current = skip;
                    trace!(?current, "time skipped");
                }
            }

            // Wake due alarms in (deadline, registration) order
            let mut to_wake = Vec::new();
            {
                let mut sleeping = self.executor.sleeping.lock().unwrap();
                while let Some(next) = sleeping.peek() {
                    if next.time <= current {
                        let alarm = sleeping.pop().unwrap();
                        to_wake.push(alarm.waker);
                    } else {
                        break;
                    }
                }
            }
            for waker in to_wake {
                waker.wake();
            }

            // If nothing is ready and nothing is sleeping, no task can ever
            // make progress again
            if self.executor.tasks.len() == 0 && self.executor.sleeping.lock().unwrap().is_empty()
            {
                panic!("runtime stalled");
            }
            iter += 1;
        }
    }
}

/// Implementation of [crate::Spawner], [crate::Clock], and [crate::Metrics]
/// for the deterministic runtime.
pub struct Context {
    label: String,
    executor: Arc<Executor>,
}

impl Context {
    fn new(executor: Arc<Executor>) -> Self {
        Self {
            label: String::new(),
            executor,
        }
    }

    /// Return the determinism auditor for this runtime.
    pub fn auditor(&self) -> Arc<Auditor> {
        self.executor.auditor.clone()
    }
}

impl Clone for Context {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            executor: self.executor.clone(),
        }
    }
}

impl crate::Spawner for Context {
    fn spawn<F, Fut, T>(self, f: F) -> Handle<T>
    where
        F: FnOnce(Self) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        // Get metrics
        let label = self.label.clone();
        let work = Work {
            label: label.clone(),
        };
        let executor = self.executor.clone();
        executor.metrics.tasks_spawned.get_or_create(&work).inc();
        let gauge = executor.metrics.tasks_running.get_or_create(&work).clone();

        // Set up the task
        let future = f(self);
        let (future, handle) = Handle::init(future, gauge);

        // Spawn the task
        Tasks::register(&executor.tasks, &label, Box::pin(future));
        handle
    }
}

impl MetricsTrait for Context {
    fn with_label(&self, label: &str) -> Self {
        let label = {
            let prefix = self.label.clone();
            if prefix.is_empty() {
                label.to_string()
            } else {
                format!("{prefix}_{label}")
            }
        };
        assert!(
            !label.starts_with(METRICS_PREFIX),
            "using runtime label is not allowed"
        );
        Self {
            label,
            executor: self.executor.clone(),
        }
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn register<N: Into<String>, H: Into<String>>(&self, name: N, help: H, metric: impl Metric) {
        let name = name.into();
        let prefixed = {
            let prefix = &self.label;
            if prefix.is_empty() {
                name
            } else {
                format!("{prefix}_{name}")
            }
        };
        self.executor
            .registry
            .lock()
            .unwrap()
            .register(prefixed, help, metric)
    }

    fn encode(&self) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, &self.executor.registry.lock().unwrap()).expect("encoding failed");
        buffer
    }
}

struct Sleeper {
    executor: Arc<Executor>,
    time: SystemTime,
    registered: bool,
}

struct Alarm {
    time: SystemTime,
    seq: u64,
    waker: Waker,
}

impl PartialEq for Alarm {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for Alarm {}

impl PartialOrd for Alarm {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Alarm {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse the ordering for a min-heap, breaking deadline ties by
        // registration order
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl Future for Sleeper {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        {
            let current = *self.executor.time.lock().unwrap();
            if current >= self.time {
                return Poll::Ready(());
            }
        }
        if !self.registered {
            self.registered = true;
            let seq = self.executor.next_alarm();
            self.executor.sleeping.lock().unwrap().push(Alarm {
                time: self.time,
                seq,
                waker: cx.waker().clone(),
            });
        }
        Poll::Pending
    }
}

impl Clock for Context {
    fn current(&self) -> SystemTime {
        *self.executor.time.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static {
        let deadline = self
            .current()
            .checked_add(duration)
            .expect("overflow when setting wake time");
        self.sleep_until(deadline)
    }

    fn sleep_until(&self, deadline: SystemTime) -> impl Future<Output = ()> + Send + 'static {
        Sleeper {
            executor: self.executor.clone(),
            time: deadline,
            registered: false,
        }
    }
}

impl RngCore for Context {
    fn next_u32(&mut self) -> u32 {
        self.executor.auditor.rand("next_u32");
        self.executor.rng.lock().unwrap().next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.executor.auditor.rand("next_u64");
        self.executor.rng.lock().unwrap().next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.executor.auditor.rand("fill_bytes");
        self.executor.rng.lock().unwrap().fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.executor.auditor.rand("try_fill_bytes");
        self.executor.rng.lock().unwrap().try_fill_bytes(dest)
    }
}
