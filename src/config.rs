use crate::{
    error::OfficeError,
    office::{
        connection::RetryPolicy,
        instance::InstanceSettings,
        pool::PoolSettings,
        process::{default_office_args, resolve_office_program, ProcessSettings, StopMode},
        InstanceId,
    },
    util::expand_tilde,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: Pool,
    #[serde(default)]
    pub process: Process,
    #[serde(default)]
    pub connection: Connection,
    #[serde(default)]
    pub converter: Converter,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        Ok(cfg)
    }

    /// Typed pool settings, validated.
    pub fn pool_settings(&self) -> crate::error::Result<PoolSettings> {
        let instances = self
            .pool
            .ports
            .iter()
            .map(|p| InstanceId::Port(*p))
            .chain(self.pool.pipe_names.iter().map(|n| InstanceId::Pipe(n.clone())))
            .collect();
        if self.pool.ports.contains(&0) {
            return Err(OfficeError::Config("port 0 is not a valid office port".into()));
        }
        let settings = PoolSettings {
            instances,
            host: self.pool.host.clone(),
            task_queue_timeout: Duration::from_millis(self.pool.task_queue_timeout_ms),
            instance: InstanceSettings {
                task_execution_timeout: Duration::from_millis(self.pool.task_execution_timeout_ms),
                max_tasks_per_process: self.pool.max_tasks_per_process,
                start_retries: self.process.start_retries.max(1),
                retry_interval: Duration::from_millis(self.process.retry_interval_ms),
                stop_timeout: Duration::from_millis(self.process.stop_timeout_ms),
                connect: self.connection.retry_policy(),
                health_check_interval: Duration::from_millis(
                    self.connection.health_check_interval_ms.max(10),
                ),
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn process_settings(&self) -> ProcessSettings {
        ProcessSettings {
            program: resolve_office_program(&self.process.program),
            args: self.process.args.clone(),
            work_dir: expand_tilde(&self.process.work_dir),
            env: self.process.env.clone(),
            stop_mode: self.process.stop_mode,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub ports: Vec<u16>,
    pub pipe_names: Vec<String>,
    pub host: String,
    pub task_queue_timeout_ms: u64,
    pub task_execution_timeout_ms: u64,
    /// 0 disables planned restarts.
    pub max_tasks_per_process: u32,
}
impl Default for Pool {
    fn default() -> Self {
        Self {
            ports: vec![2002],
            pipe_names: Vec::new(),
            host: "127.0.0.1".into(),
            task_queue_timeout_ms: 30_000,
            task_execution_timeout_ms: 120_000,
            max_tasks_per_process: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    /// Office executable, or "auto" to look it up.
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: String,
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
    pub stop_mode: StopMode,
    pub start_retries: u32,
    pub retry_interval_ms: u64,
    pub stop_timeout_ms: u64,
}
impl Default for Process {
    fn default() -> Self {
        Self {
            program: "auto".into(),
            args: default_office_args(),
            work_dir: ".office-pool-work".into(),
            env: Default::default(),
            stop_mode: StopMode::Terminate,
            start_retries: 3,
            retry_interval_ms: 250,
            stop_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub connect_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub connect_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    /// Replies longer than this drop the session.
    pub max_response_bytes: usize,
}
impl Default for Connection {
    fn default() -> Self {
        Self {
            connect_retries: 20,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
            connect_timeout_ms: 2_000,
            health_check_interval_ms: 500,
            max_response_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Connection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.connect_retries.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Converter {
    /// Output format used when neither --format nor an output extension says otherwise.
    pub default_format: String,
    pub out_dir: String,
    pub refresh: bool,
}
impl Default for Converter {
    fn default() -> Self {
        Self {
            default_format: "pdf".into(),
            out_dir: "out".into(),
            refresh: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}
