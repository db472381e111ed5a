use crate::{
    error::{OfficeError, Result},
    office::{
        connection::{Bridge, Connection, RetryPolicy},
        process::{ProcessController, ProcessHandle},
        state::InstanceState,
        task::{Fail, Task, TaskId},
        Endpoint, InstanceId,
    },
};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct InstanceSettings {
    /// Watchdog for a single task.
    pub task_execution_timeout: Duration,
    /// Planned restart after this many tasks; 0 disables it.
    pub max_tasks_per_process: u32,
    /// Process start + connect attempts before the instance is marked failed.
    pub start_retries: u32,
    pub retry_interval: Duration,
    /// Grace period between the stop request and the kill.
    pub stop_timeout: Duration,
    pub connect: RetryPolicy,
    /// How often an idle or busy instance checks its process is still alive.
    pub health_check_interval: Duration,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            task_execution_timeout: Duration::from_secs(120),
            max_tasks_per_process: 200,
            start_retries: 3,
            retry_interval: Duration::from_millis(250),
            stop_timeout: Duration::from_secs(10),
            connect: RetryPolicy::default(),
            health_check_interval: Duration::from_millis(500),
        }
    }
}

/// Receives availability changes of pooled instances.
pub trait InstanceObserver: Send + Sync {
    /// The instance is idle and accepts exactly one task.
    fn available(&self, index: usize);
    /// The instance left the idle rotation.
    fn unavailable(&self, index: usize);
    /// An admitted task the instance never started; hand it to someone else.
    fn reclaim(&self, task: Task);
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub state: InstanceState,
    pub pid: Option<u32>,
    /// Bumped on every successful process launch.
    pub generation: u64,
    /// Tasks run by the current process.
    pub task_count: u32,
    pub restarts: u32,
    pub current_task: Option<TaskId>,
    pub last_error: Option<String>,
}

enum Event {
    /// A task was admitted into the pending slot.
    Wake,
    Finished {
        task: TaskId,
        outcome: Result<()>,
    },
    Lost {
        generation: u64,
    },
    Stop(Sender<Result<()>>),
}

struct Live {
    process: ProcessHandle,
    connection: Arc<Connection>,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestartKind {
    /// Crash or hang: kill without grace.
    Forced,
    /// Task limit reached: stop gracefully.
    Planned,
}

enum Flow {
    Idle,
    Restart(RestartKind, &'static str),
    Stop(Sender<Result<()>>),
    Exit,
}

struct Status {
    snapshot: InstanceSnapshot,
    pending: Option<Task>,
}

struct Worker {
    events: Sender<Event>,
    thread: JoinHandle<()>,
}

/// Supervises one office process and its bridge connection.
///
/// All process and connection state lives on a dedicated worker thread, so
/// transitions are serialized. Other threads only touch the status block and
/// the single pending-task slot.
pub struct OfficeInstance {
    index: usize,
    endpoint: Endpoint,
    settings: InstanceSettings,
    controller: Arc<dyn ProcessController>,
    bridge: Arc<dyn Bridge>,
    observer: Arc<dyn InstanceObserver>,
    status: Mutex<Status>,
    worker: Mutex<Option<Worker>>,
    stopping: AtomicBool,
    generations: AtomicU64,
}

impl OfficeInstance {
    pub fn new(
        index: usize,
        endpoint: Endpoint,
        settings: InstanceSettings,
        controller: Arc<dyn ProcessController>,
        bridge: Arc<dyn Bridge>,
        observer: Arc<dyn InstanceObserver>,
    ) -> Self {
        let snapshot = InstanceSnapshot {
            id: endpoint.id.clone(),
            state: InstanceState::NotStarted,
            pid: None,
            generation: 0,
            task_count: 0,
            restarts: 0,
            current_task: None,
            last_error: None,
        };
        Self {
            index,
            endpoint,
            settings,
            controller,
            bridge,
            observer,
            status: Mutex::new(Status {
                snapshot,
                pending: None,
            }),
            worker: Mutex::new(None),
            stopping: AtomicBool::new(false),
            generations: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.endpoint.id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> InstanceState {
        self.status().snapshot.state
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        self.status().snapshot.clone()
    }

    /// Launch the process, connect, and hand both to a new worker thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            if self.state().is_live() {
                return Ok(());
            }
            // The previous worker gave up (failed restart); reap it.
            if let Some(old) = worker.take() {
                drop(old.events);
                let _ = old.thread.join();
            }
        }

        self.stopping.store(false, Ordering::SeqCst);
        let (events_tx, events_rx) = mpsc::channel();
        let live = match self.launch(&events_tx) {
            Ok(live) => live,
            Err(e) => {
                self.mark_failed(&e);
                return Err(e);
            }
        };

        self.mark_started(&live, true);
        let me = Arc::clone(self);
        let tx = events_tx.clone();
        let thread = std::thread::Builder::new()
            .name(format!("office-{}", self.endpoint.id.slug()))
            .spawn(move || me.run(live, tx, events_rx))
            .map_err(|e| OfficeError::ProcessStart {
                instance: self.endpoint.id.to_string(),
                reason: format!("spawning worker thread: {e}"),
            });
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                self.mark_failed(&e);
                return Err(e);
            }
        };
        *worker = Some(Worker {
            events: events_tx,
            thread,
        });
        drop(worker);

        info!("[{}] office instance started", self.endpoint.id);
        self.observer.available(self.index);
        Ok(())
    }

    /// Capacity-1 admission gate: accepted only when idle; otherwise the
    /// task is handed straight back.
    pub fn execute(&self, task: Task) -> std::result::Result<(), Task> {
        let worker = lock(&self.worker);
        let Some(worker) = worker.as_ref() else {
            return Err(task);
        };
        {
            let mut status = self.status();
            if !status.snapshot.state.accepts_tasks() || status.pending.is_some() {
                return Err(task);
            }
            debug!("[{}] admitting task {}", self.endpoint.id, task.id());
            status.snapshot.state = InstanceState::Busy;
            status.snapshot.current_task = Some(task.id());
            status.pending = Some(task);
        }
        if worker.events.send(Event::Wake).is_err() {
            // Worker already gone; give the task back.
            let mut status = self.status();
            status.snapshot.current_task = None;
            if let Some(task) = status.pending.take() {
                return Err(task);
            }
        }
        Ok(())
    }

    /// Disconnect and stop the process. Safe to call in any state.
    pub fn stop(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        let mut worker = lock(&self.worker);
        let result = match worker.take() {
            None => Ok(()),
            Some(Worker { events, thread }) => {
                let (reply_tx, reply_rx) = mpsc::channel();
                let result = if events.send(Event::Stop(reply_tx)).is_ok() {
                    reply_rx.recv().unwrap_or(Ok(()))
                } else {
                    Ok(())
                };
                drop(events);
                if thread.join().is_err() {
                    error!("[{}] worker thread panicked", self.endpoint.id);
                }
                result
            }
        };
        drop(worker);

        let pending = {
            let mut status = self.status();
            status.snapshot.state = InstanceState::Stopped;
            status.snapshot.pid = None;
            status.snapshot.current_task = None;
            if let Err(e) = &result {
                status.snapshot.last_error = Some(e.to_string());
            }
            status.pending.take()
        };
        if let Some(task) = pending {
            let id = task.id();
            task.fail(OfficeError::Stopped { task: id });
        }
        self.observer.unavailable(self.index);
        info!("[{}] office instance stopped", self.endpoint.id);
        result
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        lock(&self.status)
    }

    fn mark_started(&self, live: &Live, fresh: bool) {
        let mut status = self.status();
        let current = status.snapshot.state;
        if !current.can_transition_to(InstanceState::Started) {
            warn!("[{}] unexpected transition {current} -> started", self.endpoint.id);
        }
        let snap = &mut status.snapshot;
        snap.state = InstanceState::Started;
        snap.pid = Some(live.process.pid());
        snap.generation = live.generation;
        snap.task_count = 0;
        snap.current_task = None;
        if fresh {
            snap.restarts = 0;
            snap.last_error = None;
        }
    }

    fn mark_failed(&self, err: &OfficeError) {
        error!("[{}] office instance failed: {err}", self.endpoint.id);
        let mut status = self.status();
        status.snapshot.state = InstanceState::Failed;
        status.snapshot.pid = None;
        status.snapshot.current_task = None;
        status.snapshot.last_error = Some(err.to_string());
    }

    fn launch(&self, events: &Sender<Event>) -> Result<Live> {
        let attempts = self.settings.start_retries.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            if self.stopping.load(Ordering::SeqCst) {
                return Err(OfficeError::ProcessStart {
                    instance: self.endpoint.id.to_string(),
                    reason: "instance is stopping".to_string(),
                });
            }
            match self.launch_once(events) {
                Ok(live) => return Ok(live),
                Err(e) => {
                    warn!(
                        "[{}] start attempt {attempt}/{attempts} failed: {e}",
                        self.endpoint.id
                    );
                    last_err = Some(e);
                }
            }
            if attempt < attempts {
                std::thread::sleep(self.settings.retry_interval);
            }
        }
        Err(OfficeError::ProcessStart {
            instance: self.endpoint.id.to_string(),
            reason: format!(
                "{attempts} attempt(s) failed, last: {}",
                last_err.map(|e| e.to_string()).unwrap_or_default()
            ),
        })
    }

    fn launch_once(&self, events: &Sender<Event>) -> Result<Live> {
        let mut process = self.controller.start(&self.endpoint)?;
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;

        let tx = events.clone();
        let on_lost = move || {
            let _ = tx.send(Event::Lost { generation });
        };
        let connected = Connection::connect(
            self.bridge.as_ref(),
            &self.endpoint,
            &self.settings.connect,
            on_lost,
            || !self.stopping.load(Ordering::SeqCst) && self.controller.is_running(&mut process),
        );
        match connected {
            Ok(connection) => Ok(Live {
                process,
                connection: Arc::new(connection),
                generation,
            }),
            Err(e) => {
                let _ = self.controller.kill(&mut process);
                Err(e)
            }
        }
    }

    fn healthy(&self, live: &mut Live) -> bool {
        live.connection.is_connected() && self.controller.is_running(&mut live.process)
    }

    fn run(self: Arc<Self>, mut live: Live, events_tx: Sender<Event>, events: Receiver<Event>) {
        loop {
            let flow = match events.recv_timeout(self.settings.health_check_interval) {
                Ok(Event::Wake) => {
                    let pending = self.status().pending.take();
                    match pending {
                        Some(task) => self.run_task(&mut live, task, &events_tx, &events),
                        None => Flow::Idle,
                    }
                }
                Ok(Event::Lost { generation }) if generation == live.generation => {
                    warn!("[{}] connection lost while idle", self.endpoint.id);
                    Flow::Restart(RestartKind::Forced, "connection lost")
                }
                Ok(Event::Lost { .. }) | Ok(Event::Finished { .. }) => Flow::Idle,
                Ok(Event::Stop(reply)) => Flow::Stop(reply),
                Err(RecvTimeoutError::Timeout) => {
                    if self.healthy(&mut live) {
                        Flow::Idle
                    } else {
                        warn!("[{}] office process died while idle", self.endpoint.id);
                        Flow::Restart(RestartKind::Forced, "process died")
                    }
                }
                Err(RecvTimeoutError::Disconnected) => Flow::Exit,
            };

            let flow = match flow {
                Flow::Idle if self.task_limit_reached() => {
                    Flow::Restart(RestartKind::Planned, "task limit reached")
                }
                other => other,
            };

            match flow {
                Flow::Idle => {
                    let became_idle = {
                        let mut status = self.status();
                        if status.snapshot.state == InstanceState::Busy && status.pending.is_none() {
                            status.snapshot.state = InstanceState::Started;
                            status.snapshot.current_task = None;
                            true
                        } else {
                            false
                        }
                    };
                    if became_idle {
                        self.observer.available(self.index);
                    }
                }
                Flow::Restart(kind, reason) => match self.restart(live, kind, reason, &events_tx) {
                    Some(next) => live = next,
                    None => return,
                },
                Flow::Stop(reply) => {
                    let _ = reply.send(self.teardown(live));
                    return;
                }
                Flow::Exit => {
                    let _ = self.teardown(live);
                    return;
                }
            }
        }
    }

    fn task_limit_reached(&self) -> bool {
        let max = self.settings.max_tasks_per_process;
        if max == 0 {
            return false;
        }
        let status = self.status();
        status.snapshot.task_count >= max && status.snapshot.state == InstanceState::Busy
    }

    /// Run one task on its own thread under the watchdog. The instance stays
    /// Busy until the caller decides what comes next.
    fn run_task(
        &self,
        live: &mut Live,
        task: Task,
        events_tx: &Sender<Event>,
        events: &Receiver<Event>,
    ) -> Flow {
        let (task_id, work, fail) = task.into_parts();
        let id = &self.endpoint.id;
        debug!("[{id}] running task {task_id}");

        let connection = Arc::clone(&live.connection);
        let tx = events_tx.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("office-task-{task_id}"))
            .spawn(move || {
                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| work(&connection))) {
                    Ok(outcome) => outcome,
                    Err(_) => Err(OfficeError::TaskPanicked { task: task_id }),
                };
                let _ = tx.send(Event::Finished {
                    task: task_id,
                    outcome,
                });
            });
        if let Err(e) = spawned {
            error!("[{id}] could not spawn task thread: {e}");
            fail(OfficeError::Rejected {
                task: task_id,
                instance: id.to_string(),
                reason: format!("spawning task thread: {e}"),
            });
            return Flow::Idle;
        }

        let timeout = self.settings.task_execution_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!("[{id}] task {task_id} timed out after {timeout:?}");
                self.fail_running(
                    &fail,
                    OfficeError::TaskTimeout {
                        task: task_id,
                        timeout_ms: timeout.as_millis() as u64,
                    },
                );
                return Flow::Restart(RestartKind::Forced, "task timeout");
            }
            let wait = (deadline - now).min(self.settings.health_check_interval);
            match events.recv_timeout(wait) {
                Ok(Event::Finished { task, outcome }) if task == task_id => {
                    self.status().snapshot.task_count += 1;
                    return match outcome {
                        Ok(()) => {
                            debug!("[{id}] task {task_id} done");
                            Flow::Idle
                        }
                        Err(e) if e.is_connection_lost() => {
                            self.fail_running(&fail, e);
                            Flow::Restart(RestartKind::Forced, "connection lost")
                        }
                        Err(e) => {
                            debug!("[{id}] task {task_id} failed: {e}");
                            fail(e);
                            Flow::Idle
                        }
                    };
                }
                Ok(Event::Lost { generation }) if generation == live.generation => {
                    warn!("[{id}] connection lost during task {task_id}");
                    self.fail_running(&fail, self.connection_lost());
                    return Flow::Restart(RestartKind::Forced, "connection lost");
                }
                Ok(Event::Stop(reply)) => {
                    fail(OfficeError::Stopped { task: task_id });
                    return Flow::Stop(reply);
                }
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => {
                    if !self.healthy(live) {
                        warn!("[{id}] office process died during task {task_id}");
                        self.fail_running(&fail, self.connection_lost());
                        return Flow::Restart(RestartKind::Forced, "process died");
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    fail(OfficeError::Stopped { task: task_id });
                    return Flow::Exit;
                }
            }
        }
    }

    fn fail_running(&self, fail: &Fail, err: OfficeError) {
        self.status().snapshot.last_error = Some(err.to_string());
        fail(err);
    }

    fn connection_lost(&self) -> OfficeError {
        OfficeError::ConnectionLost {
            instance: self.endpoint.id.to_string(),
        }
    }

    fn restart(
        &self,
        mut old: Live,
        kind: RestartKind,
        reason: &str,
        events_tx: &Sender<Event>,
    ) -> Option<Live> {
        let id = &self.endpoint.id;
        // Close the admission gate and empty the slot under one lock.
        let reclaimed = {
            let mut status = self.status();
            let current = status.snapshot.state;
            if !current.can_transition_to(InstanceState::Restarting) {
                warn!("[{id}] unexpected transition {current} -> restarting");
            }
            status.snapshot.state = InstanceState::Restarting;
            status.snapshot.restarts += 1;
            status.snapshot.current_task = None;
            status.pending.take()
        };
        self.observer.unavailable(self.index);
        if let Some(task) = reclaimed {
            debug!("[{id}] handing back task {} before restart", task.id());
            self.observer.reclaim(task);
        }

        let uptime = old.process.uptime();
        match kind {
            RestartKind::Forced => {
                warn!("[{id}] restarting office process ({reason}, up {uptime:.1?})")
            }
            RestartKind::Planned => {
                info!("[{id}] restarting office process ({reason}, up {uptime:.1?})")
            }
        }
        old.connection.disconnect();
        let stopped = match kind {
            RestartKind::Forced => self.controller.kill(&mut old.process),
            RestartKind::Planned => self
                .controller
                .stop(&mut old.process, self.settings.stop_timeout),
        };
        if let Err(e) = stopped {
            warn!("[{id}] {e}");
        }
        drop(old);

        match self.launch(events_tx) {
            Ok(live) => {
                self.mark_started(&live, false);
                info!("[{id}] office process restarted (pid={})", live.process.pid());
                self.observer.available(self.index);
                Some(live)
            }
            Err(e) => {
                self.mark_failed(&e);
                None
            }
        }
    }

    fn teardown(&self, mut live: Live) -> Result<()> {
        self.observer.unavailable(self.index);
        live.connection.disconnect();
        self.controller
            .stop(&mut live.process, self.settings.stop_timeout)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
