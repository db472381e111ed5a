use crate::{
    config::Config,
    error::{OfficeError, Result},
    office::{
        connection::{Bridge, Connection, SocketBridge},
        instance::{InstanceObserver, InstanceSettings, InstanceSnapshot, OfficeInstance},
        process::{LocalProcessController, ProcessController},
        state::InstanceState,
        task::{CancelQueued, Task, TaskHandle, TaskId},
        Endpoint, InstanceId,
    },
};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// One office instance per entry, in this order.
    pub instances: Vec<InstanceId>,
    pub host: String,
    /// How long a task may wait in the queue for an idle instance.
    pub task_queue_timeout: Duration,
    pub instance: InstanceSettings,
}

impl PoolSettings {
    pub fn validate(&self) -> Result<()> {
        if self.instances.is_empty() {
            return Err(OfficeError::Config(
                "at least one port or pipe name is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for id in &self.instances {
            if !seen.insert(id) {
                return Err(OfficeError::Config(format!("duplicate office instance {id}")));
            }
        }
        if self.task_queue_timeout.is_zero() {
            return Err(OfficeError::Config("task_queue_timeout must be > 0".to_string()));
        }
        if self.instance.task_execution_timeout.is_zero() {
            return Err(OfficeError::Config("task_execution_timeout must be > 0".to_string()));
        }
        Ok(())
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            instances: vec![InstanceId::Port(2002)],
            host: "127.0.0.1".to_string(),
            task_queue_timeout: Duration::from_secs(30),
            instance: InstanceSettings::default(),
        }
    }
}

/// Outcome of [`OfficePool::start`] when at least one instance came up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    pub started: usize,
    /// Start errors of the instances left out of rotation, in instance order.
    pub failures: Vec<OfficeError>,
}

impl StartReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

struct Queued {
    task: Task,
    deadline: Instant,
}

struct PoolState {
    running: bool,
    queue: VecDeque<Queued>,
    /// Idle instance indexes, longest idle first.
    idle: VecDeque<usize>,
}

/// The only state shared between callers, instances and the dispatcher.
struct Shared {
    state: Mutex<PoolState>,
    wakeup: Condvar,
    queue_timeout: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InstanceObserver for Shared {
    fn available(&self, index: usize) {
        let mut state = self.lock();
        if state.running && !state.idle.contains(&index) {
            state.idle.push_back(index);
            self.wakeup.notify_all();
        }
    }

    fn unavailable(&self, index: usize) {
        self.lock().idle.retain(|i| *i != index);
    }

    fn reclaim(&self, task: Task) {
        let mut state = self.lock();
        if state.running {
            let deadline = task.submitted_at() + self.queue_timeout;
            state.queue.push_front(Queued { task, deadline });
            self.wakeup.notify_all();
        } else {
            drop(state);
            let id = task.id();
            task.fail(OfficeError::Stopped { task: id });
        }
    }
}

impl CancelQueued for Shared {
    fn cancel_queued(&self, id: TaskId) -> bool {
        let removed = {
            let mut state = self.lock();
            let pos = state.queue.iter().position(|q| q.task.id() == id);
            pos.and_then(|pos| state.queue.remove(pos))
        };
        match removed {
            Some(queued) => {
                debug!("task {id} cancelled while queued");
                queued.task.fail(OfficeError::Cancelled { task: id });
                true
            }
            None => false,
        }
    }
}

/// A fixed set of supervised office instances behind one FIFO task queue.
pub struct OfficePool {
    settings: PoolSettings,
    shared: Arc<Shared>,
    instances: Arc<Vec<Arc<OfficeInstance>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    next_task: AtomicU64,
}

impl OfficePool {
    pub fn new(
        settings: PoolSettings,
        controller: Arc<dyn ProcessController>,
        bridge: Arc<dyn Bridge>,
    ) -> Result<Self> {
        settings.validate()?;
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                running: false,
                queue: VecDeque::new(),
                idle: VecDeque::new(),
            }),
            wakeup: Condvar::new(),
            queue_timeout: settings.task_queue_timeout,
        });
        let observer: Arc<dyn InstanceObserver> = shared.clone();
        let instances = settings
            .instances
            .iter()
            .enumerate()
            .map(|(index, id)| {
                Arc::new(OfficeInstance::new(
                    index,
                    Endpoint::new(id.clone(), settings.host.clone()),
                    settings.instance.clone(),
                    Arc::clone(&controller),
                    Arc::clone(&bridge),
                    Arc::clone(&observer),
                ))
            })
            .collect();
        Ok(Self {
            settings,
            shared,
            instances: Arc::new(instances),
            dispatcher: Mutex::new(None),
            next_task: AtomicU64::new(1),
        })
    }

    /// Pool backed by local office processes and the socket bridge.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let settings = cfg.pool_settings()?;
        let controller = Arc::new(LocalProcessController::new(cfg.process_settings()));
        let bridge = Arc::new(
            SocketBridge::new(cfg.connection.connect_timeout())
                .with_max_response_bytes(cfg.connection.max_response_bytes),
        );
        Self::new(settings, controller, bridge)
    }

    pub fn size(&self) -> usize {
        self.instances.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    /// Tasks waiting for an instance.
    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Instances currently running a task.
    pub fn in_flight(&self) -> usize {
        self.instances
            .iter()
            .filter(|i| i.state() == InstanceState::Busy)
            .count()
    }

    pub fn snapshot(&self) -> Vec<InstanceSnapshot> {
        self.instances.iter().map(|i| i.snapshot()).collect()
    }

    /// Start every instance. Instances that cannot be started are left
    /// failed and the pool runs with what remains; their errors come back in
    /// the report. Only a pool where nothing started is an error, and then
    /// anything submitted meanwhile fails with `Stopped`.
    pub fn start(&self) -> Result<StartReport> {
        let mut dispatcher = lock(&self.dispatcher);
        if dispatcher.is_some() {
            let started = self
                .instances
                .iter()
                .filter(|i| i.state() != InstanceState::Failed)
                .count();
            return Ok(StartReport {
                started,
                failures: Vec::new(),
            });
        }

        {
            let mut state = self.shared.lock();
            state.running = true;
            state.idle.clear();
        }
        let shared = Arc::clone(&self.shared);
        let instances = Arc::clone(&self.instances);
        let handle = std::thread::Builder::new()
            .name("office-pool-dispatch".to_string())
            .spawn(move || dispatch_loop(shared, instances))
            .map_err(|e| {
                self.shared.lock().running = false;
                OfficeError::Config(format!("spawning dispatcher thread: {e}"))
            })?;

        let failures = self.for_each_instance(|instance| instance.start());
        if failures.len() == self.instances.len() {
            error!("office pool could not start any instance");
            self.halt();
            if handle.join().is_err() {
                error!("office pool dispatcher panicked");
            }
            return Err(OfficeError::PoolStart(failures));
        }
        for failure in &failures {
            error!("office instance left out of the pool: {failure}");
        }

        *dispatcher = Some(handle);
        let report = StartReport {
            started: self.instances.len() - failures.len(),
            failures,
        };
        info!(
            "office pool started ({}/{} instances)",
            report.started,
            self.instances.len()
        );
        Ok(report)
    }

    /// Stop every instance, best effort. Queued tasks fail with `Stopped`.
    /// Stopping a stopped pool does nothing.
    pub fn stop(&self) -> Result<()> {
        let mut dispatcher = lock(&self.dispatcher);
        let Some(handle) = dispatcher.take() else {
            return Ok(());
        };

        self.halt();
        if handle.join().is_err() {
            error!("office pool dispatcher panicked");
        }

        let errors = self.for_each_instance(|instance| instance.stop());
        if errors.is_empty() {
            info!("office pool stopped");
            Ok(())
        } else {
            for e in &errors {
                warn!("{e}");
            }
            Err(OfficeError::PoolStop(errors))
        }
    }

    /// Close the queue: refuse new tasks, release the dispatcher and fail
    /// everything still waiting with `Stopped`.
    fn halt(&self) {
        let drained: Vec<Queued> = {
            let mut state = self.shared.lock();
            state.running = false;
            state.idle.clear();
            state.queue.drain(..).collect()
        };
        self.shared.wakeup.notify_all();
        for queued in drained {
            let id = queued.task.id();
            queued.task.fail(OfficeError::Stopped { task: id });
        }
    }

    /// Queue `f` for the next idle instance.
    pub fn submit<T, F>(&self, f: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let id = self.next_task.fetch_add(1, Ordering::SeqCst);
        let (task, slot) = Task::new(id, f);
        {
            let mut state = self.shared.lock();
            if !state.running {
                return Err(OfficeError::NotRunning);
            }
            let deadline = task.submitted_at() + self.settings.task_queue_timeout;
            state.queue.push_back(Queued { task, deadline });
            self.shared.wakeup.notify_all();
        }
        debug!("task {id} queued");
        let queue: Weak<dyn CancelQueued> = Arc::downgrade(&self.shared) as Weak<dyn CancelQueued>;
        Ok(TaskHandle::new(id, slot, queue))
    }

    /// Submit and block until the task resolves.
    pub fn execute<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        self.submit(f)?.wait()
    }

    /// Run `op` on every instance in parallel, collecting errors in
    /// instance order.
    fn for_each_instance(
        &self,
        op: impl Fn(&Arc<OfficeInstance>) -> Result<()> + Sync,
    ) -> Vec<OfficeError> {
        std::thread::scope(|s| {
            let handles: Vec<_> = self
                .instances
                .iter()
                .map(|instance| (instance, s.spawn(|| op(instance))))
                .collect();
            handles
                .into_iter()
                .filter_map(|(instance, handle)| match handle.join() {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(_) => Some(OfficeError::ProcessStart {
                        instance: instance.id().to_string(),
                        reason: "lifecycle thread panicked".to_string(),
                    }),
                })
                .collect()
        })
    }
}

impl Drop for OfficePool {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                warn!("stopping office pool on drop: {e}");
            }
        }
    }
}

/// Pair the oldest queued task with the longest idle instance until the pool
/// stops; expire tasks that waited past their deadline.
fn dispatch_loop(shared: Arc<Shared>, instances: Arc<Vec<Arc<OfficeInstance>>>) {
    loop {
        let (index, queued) = {
            let mut state = shared.lock();
            loop {
                if !state.running {
                    return;
                }
                expire(&mut state.queue, shared.queue_timeout);
                if !state.queue.is_empty() && !state.idle.is_empty() {
                    break;
                }
                let next_deadline = state.queue.iter().map(|q| q.deadline).min();
                state = match next_deadline {
                    Some(deadline) => {
                        let wait = deadline.saturating_duration_since(Instant::now());
                        shared
                            .wakeup
                            .wait_timeout(state, wait)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0
                    }
                    None => shared
                        .wakeup
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner),
                };
            }
            match (state.idle.pop_front(), state.queue.pop_front()) {
                (Some(index), Some(queued)) => (index, queued),
                _ => continue,
            }
        };

        let instance = &instances[index];
        let deadline = queued.deadline;
        debug!("dispatching task {} to {}", queued.task.id(), instance.id());
        if let Err(task) = instance.execute(queued.task) {
            debug!(
                "{} ({}) refused task {}, requeueing",
                instance.id(),
                instance.state(),
                task.id()
            );
            let mut state = shared.lock();
            if state.running {
                state.queue.push_front(Queued { task, deadline });
            } else {
                drop(state);
                let id = task.id();
                task.fail(OfficeError::Stopped { task: id });
            }
        }
    }
}

fn expire(queue: &mut VecDeque<Queued>, timeout: Duration) {
    let now = Instant::now();
    let mut i = 0;
    while i < queue.len() {
        if queue[i].deadline <= now {
            if let Some(queued) = queue.remove(i) {
                let id = queued.task.id();
                warn!("task {id} waited {timeout:?} without an idle office instance");
                queued.task.fail(OfficeError::NoInstanceAvailable {
                    task: id,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        } else {
            i += 1;
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
