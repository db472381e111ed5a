#![allow(dead_code)]

//! In-memory office processes and bridge sessions for pool tests.

use office_pool::error::{OfficeError, Result};
use office_pool::office::{
    Bridge, BridgeRequest, BridgeResponse, Endpoint, InstanceId, InstanceSettings, InstanceState,
    OfficePool, PoolSettings, ProcessController, ProcessHandle, RetryPolicy, Session,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Inner {
    next_pid: u32,
    alive: HashMap<u32, InstanceId>,
    broken: HashSet<InstanceId>,
    starts: HashMap<InstanceId, u32>,
    graceful_stops: u32,
    kills: u32,
    stubborn: HashSet<InstanceId>,
    ops: Vec<String>,
    pages: HashMap<u64, u64>,
    next_doc: u64,
}

/// Shared state behind [`FakeController`] and [`FakeBridge`].
#[derive(Default)]
pub struct FakeOffice {
    inner: Mutex<Inner>,
}

impl FakeOffice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                next_pid: 1000,
                ..Default::default()
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn controller(self: &Arc<Self>) -> Arc<dyn ProcessController> {
        Arc::new(FakeController(Arc::clone(self)))
    }

    pub fn bridge(self: &Arc<Self>) -> Arc<dyn Bridge> {
        Arc::new(FakeBridge(Arc::clone(self)))
    }

    /// Kill the live process of `id` behind the pool's back.
    pub fn crash(&self, id: &InstanceId) {
        self.lock().alive.retain(|_, owner| *owner != *id);
    }

    /// Every following start of `id` fails.
    pub fn break_starts(&self, id: &InstanceId) {
        self.lock().broken.insert(id.clone());
    }

    /// Processes of `id` ignore the graceful stop request from now on.
    pub fn set_stubborn(&self, id: &InstanceId) {
        self.lock().stubborn.insert(id.clone());
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.lock().alive.contains_key(&pid)
    }

    pub fn live_processes(&self) -> usize {
        self.lock().alive.len()
    }

    pub fn starts(&self, id: &InstanceId) -> u32 {
        self.lock().starts.get(id).copied().unwrap_or(0)
    }

    pub fn graceful_stops(&self) -> u32 {
        self.lock().graceful_stops
    }

    pub fn kills(&self) -> u32 {
        self.lock().kills
    }

    /// Bridge operations seen so far, in order.
    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }
}

pub struct FakeController(Arc<FakeOffice>);

impl ProcessController for FakeController {
    fn start(&self, endpoint: &Endpoint) -> Result<ProcessHandle> {
        let mut inner = self.0.lock();
        *inner.starts.entry(endpoint.id.clone()).or_default() += 1;
        if inner.broken.contains(&endpoint.id) {
            return Err(OfficeError::ProcessStart {
                instance: endpoint.id.to_string(),
                reason: "broken install".into(),
            });
        }
        inner.next_pid += 1;
        let pid = inner.next_pid;
        inner.alive.insert(pid, endpoint.id.clone());
        Ok(ProcessHandle::detached(endpoint.id.clone(), pid))
    }

    fn stop(&self, handle: &mut ProcessHandle, _grace: Duration) -> Result<()> {
        let mut inner = self.0.lock();
        if inner.alive.remove(&handle.pid()).is_none() {
            return Ok(());
        }
        if inner.stubborn.contains(handle.instance()) {
            inner.kills += 1;
            return Err(OfficeError::ProcessStop {
                instance: handle.instance().to_string(),
                reason: "ignored stop request; killed".into(),
            });
        }
        inner.graceful_stops += 1;
        Ok(())
    }

    fn is_running(&self, handle: &mut ProcessHandle) -> bool {
        self.0.is_alive(handle.pid())
    }

    fn kill(&self, handle: &mut ProcessHandle) -> Result<()> {
        let mut inner = self.0.lock();
        if inner.alive.remove(&handle.pid()).is_some() {
            inner.kills += 1;
        }
        Ok(())
    }
}

pub struct FakeBridge(Arc<FakeOffice>);

impl Bridge for FakeBridge {
    fn open(&self, endpoint: &Endpoint) -> Result<Arc<dyn Session>> {
        let inner = self.0.lock();
        let pid = inner
            .alive
            .iter()
            .find(|(_, owner)| **owner == endpoint.id)
            .map(|(pid, _)| *pid)
            .ok_or_else(|| OfficeError::Connection {
                instance: endpoint.id.to_string(),
                reason: "nothing listening".into(),
            })?;
        Ok(Arc::new(FakeSession {
            office: Arc::clone(&self.0),
            instance: endpoint.id.clone(),
            pid,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Session to one fake process. Supported ops:
/// `pid`, `echo`, `sleep {ms}`, `hang`, `fail`, and the document ops
/// `load`, `refresh`, `page_count`, `select_page`, `store`, `close`.
pub struct FakeSession {
    office: Arc<FakeOffice>,
    instance: InstanceId,
    pid: u32,
    closed: AtomicBool,
}

impl FakeSession {
    fn lost(&self) -> OfficeError {
        OfficeError::ConnectionLost {
            instance: self.instance.to_string(),
        }
    }

    /// Sleep up to `total`, bailing out as soon as the process dies.
    fn pause(&self, total: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        loop {
            if !self.is_alive() {
                return Err(self.lost());
            }
            if let Some(total) = total {
                if start.elapsed() >= total {
                    return Ok(());
                }
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Session for FakeSession {
    fn call(&self, request: &BridgeRequest) -> Result<BridgeResponse> {
        if !self.is_alive() {
            return Err(self.lost());
        }
        self.office.lock().ops.push(request.op.clone());
        let doc = request.args.get("doc").and_then(Value::as_u64).unwrap_or(0);
        let value = match request.op.as_str() {
            "pid" => json!(self.pid),
            "echo" => request.args.clone(),
            "sleep" => {
                let ms = request.args.get("ms").and_then(Value::as_u64).unwrap_or(0);
                self.pause(Some(Duration::from_millis(ms)))?;
                Value::Null
            }
            "hang" => {
                self.pause(None)?;
                Value::Null
            }
            "fail" => return Ok(BridgeResponse::failed("remote error")),
            "load" => {
                let mut inner = self.office.lock();
                inner.next_doc += 1;
                let id = inner.next_doc;
                inner.pages.insert(id, 3);
                json!(id)
            }
            "page_count" => json!(self.office.lock().pages.get(&doc).copied().unwrap_or(0)),
            "select_page" => {
                self.office.lock().pages.insert(doc, 1);
                Value::Null
            }
            "store" => {
                let url = request.args.get("url").and_then(Value::as_str).unwrap_or("");
                if url.contains("readonly") {
                    return Ok(BridgeResponse::failed("target is read-only"));
                }
                let path = url::Url::parse(url)
                    .ok()
                    .and_then(|u| u.to_file_path().ok())
                    .ok_or_else(|| OfficeError::Bridge {
                        op: "store".into(),
                        reason: format!("bad url {url}"),
                    })?;
                let filter = request.args.get("filter").and_then(Value::as_str).unwrap_or("");
                let pages = self.office.lock().pages.get(&doc).copied().unwrap_or(0);
                std::fs::write(&path, format!("{filter}:{pages}")).map_err(|e| {
                    OfficeError::Bridge {
                        op: "store".into(),
                        reason: e.to_string(),
                    }
                })?;
                Value::Null
            }
            "refresh" | "close" => Value::Null,
            other => return Ok(BridgeResponse::failed(format!("unknown op {other}"))),
        };
        Ok(BridgeResponse::ok(value))
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.office.is_alive(self.pid)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Fast timings so restarts and health checks happen within a test.
pub fn settings(ports: &[u16]) -> PoolSettings {
    PoolSettings {
        instances: ports.iter().map(|p| InstanceId::Port(*p)).collect(),
        host: "127.0.0.1".into(),
        task_queue_timeout: Duration::from_secs(5),
        instance: InstanceSettings {
            task_execution_timeout: Duration::from_secs(5),
            max_tasks_per_process: 0,
            start_retries: 2,
            retry_interval: Duration::from_millis(10),
            stop_timeout: Duration::from_millis(200),
            connect: RetryPolicy {
                attempts: 3,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
            },
            health_check_interval: Duration::from_millis(20),
        },
    }
}

pub fn pool(office: &Arc<FakeOffice>, settings: PoolSettings) -> Arc<OfficePool> {
    Arc::new(OfficePool::new(settings, office.controller(), office.bridge()).unwrap())
}

pub fn started_pool(office: &Arc<FakeOffice>, settings: PoolSettings) -> Arc<OfficePool> {
    let pool = pool(office, settings);
    pool.start().unwrap();
    pool
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

pub fn all_idle(pool: &OfficePool) -> bool {
    pool.snapshot()
        .iter()
        .all(|s| s.state == InstanceState::Started)
}

pub fn pid_of(conn: &office_pool::office::Connection) -> Result<u32> {
    let value = conn.invoke(&BridgeRequest::new("pid"))?;
    Ok(value.as_u64().unwrap_or(0) as u32)
}

pub fn sleep_op(conn: &office_pool::office::Connection, ms: u64) -> Result<()> {
    conn.invoke(&BridgeRequest::new("sleep").with_arg("ms", ms))?;
    Ok(())
}
