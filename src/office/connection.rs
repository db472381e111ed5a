use crate::{
    error::{OfficeError, Result},
    office::{Endpoint, InstanceId},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bounded exponential backoff used while an office process comes up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub op: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
}

impl BridgeRequest {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            args: Value::Null,
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        if !self.args.is_object() {
            self.args = Value::Object(Default::default());
        }
        if let Value::Object(map) = &mut self.args {
            map.insert(key.to_string(), value.into());
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub ok: bool,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl BridgeResponse {
    pub fn ok(value: Value) -> Self {
        Self {
            ok: true,
            value,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: Value::Null,
            error: Some(error.into()),
        }
    }

    pub fn into_result(self, op: &str) -> Result<Value> {
        if self.ok {
            Ok(self.value)
        } else {
            Err(OfficeError::Bridge {
                op: op.to_string(),
                reason: self.error.unwrap_or_else(|| "remote call failed".to_string()),
            })
        }
    }
}

/// A live automation-bridge session. `call` returns `ConnectionLost` once the
/// remote side is gone.
pub trait Session: Send + Sync {
    fn call(&self, request: &BridgeRequest) -> Result<BridgeResponse>;
    fn is_alive(&self) -> bool;
    fn close(&self);
}

pub trait Bridge: Send + Sync {
    fn open(&self, endpoint: &Endpoint) -> Result<Arc<dyn Session>>;
}

type Listener = Box<dyn FnOnce() + Send>;

/// Holds the disconnect listener; whichever of `fire`/`disarm` runs first
/// consumes it.
struct DisconnectSignal {
    listener: Mutex<Option<Listener>>,
}

impl DisconnectSignal {
    fn new(listener: Listener) -> Self {
        Self {
            listener: Mutex::new(Some(listener)),
        }
    }

    fn fire(&self) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener();
        }
    }

    fn disarm(&self) {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

pub struct Connection {
    endpoint: Endpoint,
    session: Arc<dyn Session>,
    signal: DisconnectSignal,
    closed: AtomicBool,
}

impl Connection {
    /// Open a session, retrying per `policy` while `still_running` says the
    /// process is alive. `on_lost` fires at most once, and never after
    /// [`Connection::disconnect`].
    pub fn connect(
        bridge: &dyn Bridge,
        endpoint: &Endpoint,
        policy: &RetryPolicy,
        on_lost: impl FnOnce() + Send + 'static,
        mut still_running: impl FnMut() -> bool,
    ) -> Result<Connection> {
        let id = &endpoint.id;
        let attempts = policy.attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            match bridge.open(endpoint) {
                Ok(session) => {
                    info!("[{id}] connected (attempt {attempt})");
                    return Ok(Connection {
                        endpoint: endpoint.clone(),
                        session,
                        signal: DisconnectSignal::new(Box::new(on_lost)),
                        closed: AtomicBool::new(false),
                    });
                }
                Err(e) => {
                    debug!("[{id}] connect attempt {attempt}/{attempts} failed: {e}");
                    last_err = Some(e);
                }
            }
            if attempt == attempts {
                break;
            }
            if !still_running() {
                return Err(OfficeError::Connection {
                    instance: id.to_string(),
                    reason: "office process exited before accepting connections".to_string(),
                });
            }
            std::thread::sleep(policy.backoff(attempt));
        }

        Err(OfficeError::Connection {
            instance: id.to_string(),
            reason: format!(
                "gave up after {attempts} attempts: {}",
                last_err.map(|e| e.to_string()).unwrap_or_default()
            ),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn instance(&self) -> &InstanceId {
        &self.endpoint.id
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.session.is_alive()
    }

    /// Raw remote call. No timeout: a hang is the instance watchdog's problem.
    pub fn call(&self, request: &BridgeRequest) -> Result<BridgeResponse> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OfficeError::ConnectionLost {
                instance: self.endpoint.id.to_string(),
            });
        }
        match self.session.call(request) {
            Err(e) if e.is_connection_lost() => {
                warn!("[{}] bridge reports remote gone during '{}'", self.endpoint.id, request.op);
                self.signal.fire();
                Err(e)
            }
            other => other,
        }
    }

    /// Remote call that turns an `ok = false` response into a `Bridge` error.
    pub fn invoke(&self, request: &BridgeRequest) -> Result<Value> {
        self.call(request)?.into_result(&request.op)
    }

    pub fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.signal.disarm();
        self.session.close();
        info!("[{}] disconnected", self.endpoint.id);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Socket path used for pipe instances.
pub fn pipe_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(name)
}

/// Newline-delimited JSON over TCP (port instances) or a unix socket (pipe
/// instances).
#[derive(Debug, Clone)]
pub struct SocketBridge {
    connect_timeout: Duration,
    max_response_bytes: usize,
}

/// Longest reply line a session accepts before giving up on the stream.
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

impl SocketBridge {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }

    pub fn with_max_response_bytes(mut self, bytes: usize) -> Self {
        self.max_response_bytes = bytes;
        self
    }
}

impl Default for SocketBridge {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl Bridge for SocketBridge {
    fn open(&self, endpoint: &Endpoint) -> Result<Arc<dyn Session>> {
        let id = &endpoint.id;
        let refused = |reason: String| OfficeError::Connection {
            instance: id.to_string(),
            reason,
        };
        let transport = match id {
            InstanceId::Port(port) => {
                let addr = (endpoint.host.as_str(), *port)
                    .to_socket_addrs()
                    .map_err(|e| refused(format!("resolve {}: {e}", endpoint.host)))?
                    .next()
                    .ok_or_else(|| refused(format!("no address for {}", endpoint.host)))?;
                let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
                    .map_err(|e| refused(format!("connect {addr}: {e}")))?;
                stream.set_nodelay(true).ok();
                Transport::Tcp(stream)
            }
            #[cfg(unix)]
            InstanceId::Pipe(name) => {
                let path = pipe_path(name);
                let stream = std::os::unix::net::UnixStream::connect(&path)
                    .map_err(|e| refused(format!("connect {}: {e}", path.display())))?;
                Transport::Unix(stream)
            }
            #[cfg(not(unix))]
            InstanceId::Pipe(_) => {
                return Err(refused("pipe instances need unix domain sockets".to_string()));
            }
        };
        Ok(Arc::new(SocketSession::new(
            id.clone(),
            transport,
            self.max_response_bytes,
        )?))
    }
}

enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl Transport {
    fn try_clone(&self) -> std::io::Result<Transport> {
        match self {
            Transport::Tcp(s) => s.try_clone().map(Transport::Tcp),
            #[cfg(unix)]
            Transport::Unix(s) => s.try_clone().map(Transport::Unix),
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            Transport::Tcp(s) => s.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Transport::Unix(s) => s.shutdown(Shutdown::Both),
        };
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Transport::Unix(s) => s.flush(),
        }
    }
}

struct SessionIo {
    reader: BufReader<Transport>,
    writer: Transport,
}

struct SocketSession {
    instance: InstanceId,
    io: Mutex<SessionIo>,
    control: Transport,
    alive: AtomicBool,
    max_response_bytes: usize,
}

impl SocketSession {
    fn new(instance: InstanceId, transport: Transport, max_response_bytes: usize) -> Result<Self> {
        let clone = |t: &Transport| {
            t.try_clone().map_err(|e| OfficeError::Connection {
                instance: instance.to_string(),
                reason: format!("clone socket: {e}"),
            })
        };
        let reader = clone(&transport)?;
        let control = clone(&transport)?;
        Ok(Self {
            instance,
            io: Mutex::new(SessionIo {
                reader: BufReader::new(reader),
                writer: transport,
            }),
            control,
            alive: AtomicBool::new(true),
            max_response_bytes,
        })
    }

    fn lost(&self, why: &str) -> OfficeError {
        if self.alive.swap(false, Ordering::SeqCst) {
            debug!("[{}] session lost: {why}", self.instance);
        }
        OfficeError::ConnectionLost {
            instance: self.instance.to_string(),
        }
    }
}

impl Session for SocketSession {
    fn call(&self, request: &BridgeRequest) -> Result<BridgeResponse> {
        if !self.is_alive() {
            return Err(self.lost("call on closed session"));
        }
        let mut line = serde_json::to_vec(request).map_err(|e| OfficeError::Bridge {
            op: request.op.clone(),
            reason: format!("encode request: {e}"),
        })?;
        line.push(b'\n');

        let mut io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = io.writer.write_all(&line).and_then(|_| io.writer.flush()) {
            return Err(self.lost(&format!("write: {e}")));
        }

        // A reply that is cut short, oversized or unreadable leaves the
        // stream out of step with the requests, so the session is done.
        let limit = self.max_response_bytes as u64;
        let mut reply = Vec::new();
        match Read::take(&mut io.reader, limit + 1).read_until(b'\n', &mut reply) {
            Ok(0) => Err(self.lost("eof")),
            Ok(n) if reply.last() != Some(&b'\n') => {
                if n as u64 > limit {
                    Err(self.lost(&format!("response to {} exceeds {limit} bytes", request.op)))
                } else {
                    Err(self.lost("eof inside a response"))
                }
            }
            Ok(_) => serde_json::from_slice(&reply)
                .map_err(|e| self.lost(&format!("decode response to {}: {e}", request.op))),
            Err(e) => Err(self.lost(&format!("read: {e}"))),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.control.shutdown();
    }
}
