pub mod connection;
pub mod holder;
pub mod instance;
pub mod pool;
pub mod process;
pub mod state;
pub mod task;

pub use connection::{Bridge, BridgeRequest, BridgeResponse, Connection, RetryPolicy, Session, SocketBridge};
pub use instance::{InstanceObserver, InstanceSettings, InstanceSnapshot, OfficeInstance};
pub use pool::{OfficePool, PoolSettings, StartReport};
pub use process::{LocalProcessController, ProcessController, ProcessHandle, ProcessSettings, StopMode};
pub use state::InstanceState;
pub use task::{Task, TaskHandle, TaskId};

use serde::Serialize;
use std::fmt;

/// Fixed identity of one pooled office instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceId {
    Port(u16),
    Pipe(String),
}

impl InstanceId {
    /// Filesystem-safe name, used for the per-instance profile directory.
    pub fn slug(&self) -> String {
        match self {
            InstanceId::Port(port) => format!("port_{port}"),
            InstanceId::Pipe(name) => {
                let clean: String = name
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
                    .collect();
                format!("pipe_{clean}")
            }
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceId::Port(port) => write!(f, "port:{port}"),
            InstanceId::Pipe(name) => write!(f, "pipe:{name}"),
        }
    }
}

/// Where an instance's office process listens for the automation bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: InstanceId,
    pub host: String,
}

impl Endpoint {
    pub fn new(id: InstanceId, host: impl Into<String>) -> Self {
        Self {
            id,
            host: host.into(),
        }
    }

    /// Connection description handed to the office program on its command line.
    pub fn accept_string(&self) -> String {
        match &self.id {
            InstanceId::Port(port) => {
                format!("socket,host={},port={port},tcpNoDelay=1", self.host)
            }
            InstanceId::Pipe(name) => format!("pipe,name={name}"),
        }
    }
}
