use crate::{
    error::{OfficeError, Result},
    office::{Endpoint, InstanceId},
    util::{ensure_dir, expand_tilde, file_url},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lock artifacts an office process leaves in its profile after an unclean exit.
const STALE_LOCKS: [&str; 2] = [".lock", "user/.lock"];

/// Starts, stops and inspects the external office process of one instance.
pub trait ProcessController: Send + Sync {
    fn start(&self, endpoint: &Endpoint) -> Result<ProcessHandle>;

    /// Ask the process to exit, escalating to [`ProcessController::kill`]
    /// after `grace`. Escalation is reported as `ProcessStop`.
    fn stop(&self, handle: &mut ProcessHandle, grace: Duration) -> Result<()>;

    fn is_running(&self, handle: &mut ProcessHandle) -> bool;

    fn kill(&self, handle: &mut ProcessHandle) -> Result<()>;
}

/// A started office process. Killed on drop if still running.
pub struct ProcessHandle {
    instance: InstanceId,
    pid: u32,
    started_at: Instant,
    child: Option<Child>,
}

impl ProcessHandle {
    pub fn from_child(instance: InstanceId, child: Child) -> Self {
        Self {
            instance,
            pid: child.id(),
            started_at: Instant::now(),
            child: Some(child),
        }
    }

    /// Handle for a process this crate did not spawn itself.
    pub fn detached(instance: InstanceId, pid: u32) -> Self {
        Self {
            instance,
            pid,
            started_at: Instant::now(),
            child: None,
        }
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Ok(None) = child.try_wait() {
                warn!("[{}] dropping live office process pid={}, killing", self.instance, self.pid);
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// SIGTERM first, SIGKILL after the grace period (unix); kill elsewhere.
    #[default]
    Terminate,
    /// Kill immediately.
    Kill,
}

#[derive(Debug, Clone)]
pub struct ProcessSettings {
    pub program: PathBuf,
    /// Argument template; `{accept}`, `{port}`, `{pipe}`, `{profile_dir}` and
    /// `{profile_url}` are expanded per instance.
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub stop_mode: StopMode,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("soffice"),
            args: default_office_args(),
            work_dir: PathBuf::from(".office-pool-work"),
            env: BTreeMap::new(),
            stop_mode: StopMode::Terminate,
        }
    }
}

pub fn default_office_args() -> Vec<String> {
    [
        "--headless",
        "--invisible",
        "--nocrashreport",
        "--nodefault",
        "--nologo",
        "--nofirststartwizard",
        "--norestore",
        "--accept={accept};urp;",
        "-env:UserInstallation={profile_url}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Spawns the office program as a local child process.
pub struct LocalProcessController {
    settings: ProcessSettings,
}

impl LocalProcessController {
    pub fn new(settings: ProcessSettings) -> Self {
        Self { settings }
    }

    pub fn profile_dir(&self, id: &InstanceId) -> PathBuf {
        self.settings.work_dir.join(format!("profile_{}", id.slug()))
    }

    fn expand_args(&self, endpoint: &Endpoint, profile_dir: &Path) -> Result<Vec<String>> {
        let profile_url = file_url(profile_dir).map_err(|e| start_error(&endpoint.id, format!("{e:#}")))?;
        let (port, pipe) = match &endpoint.id {
            InstanceId::Port(port) => (port.to_string(), String::new()),
            InstanceId::Pipe(name) => (String::new(), name.clone()),
        };
        let accept = endpoint.accept_string();
        let profile = profile_dir.display().to_string();
        Ok(self
            .settings
            .args
            .iter()
            .map(|arg| {
                arg.replace("{accept}", &accept)
                    .replace("{port}", &port)
                    .replace("{pipe}", &pipe)
                    .replace("{profile_dir}", &profile)
                    .replace("{profile_url}", &profile_url)
            })
            .collect())
    }
}

impl ProcessController for LocalProcessController {
    fn start(&self, endpoint: &Endpoint) -> Result<ProcessHandle> {
        let id = &endpoint.id;
        let profile_dir = self.profile_dir(id);
        ensure_dir(&profile_dir).map_err(|e| start_error(id, format!("{e:#}")))?;
        clear_stale_locks(id, &profile_dir);

        let args = self.expand_args(endpoint, &profile_dir)?;
        debug!("[{id}] launching {} {:?}", self.settings.program.display(), args);

        let mut cmd = Command::new(&self.settings.program);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        for (k, v) in &self.settings.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| {
            start_error(id, format!("spawning {}: {e}", self.settings.program.display()))
        })?;

        if let Ok(Some(status)) = child.try_wait() {
            return Err(start_error(id, format!("process exited immediately with {status}")));
        }

        info!(
            "[{id}] spawned office process (pid={}, program={})",
            child.id(),
            self.settings.program.display()
        );
        Ok(ProcessHandle::from_child(id.clone(), child))
    }

    fn stop(&self, handle: &mut ProcessHandle, grace: Duration) -> Result<()> {
        if !self.is_running(handle) {
            return Ok(());
        }
        if self.settings.stop_mode == StopMode::Kill {
            return self.kill(handle);
        }

        request_exit(handle);
        let start = Instant::now();
        while start.elapsed() < grace {
            if !self.is_running(handle) {
                info!("[{}] office process pid={} exited", handle.instance, handle.pid);
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        warn!(
            "[{}] office process pid={} still running after {:?}, killing",
            handle.instance, handle.pid, grace
        );
        self.kill(handle)?;
        Err(OfficeError::ProcessStop {
            instance: handle.instance.to_string(),
            reason: format!("did not exit within {grace:?}; killed"),
        })
    }

    fn is_running(&self, handle: &mut ProcessHandle) -> bool {
        match handle.child_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn kill(&self, handle: &mut ProcessHandle) -> Result<()> {
        let instance = handle.instance.to_string();
        let pid = handle.pid;
        let Some(child) = handle.child_mut() else {
            return Ok(());
        };
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(());
        }
        info!("[{instance}] killing office process pid={pid}");
        child.kill().map_err(|e| OfficeError::ProcessStop {
            instance: instance.clone(),
            reason: format!("kill: {e}"),
        })?;
        child.wait().map_err(|e| OfficeError::ProcessStop {
            instance,
            reason: format!("wait after kill: {e}"),
        })?;
        Ok(())
    }
}

#[cfg(unix)]
fn request_exit(handle: &mut ProcessHandle) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    debug!("[{}] sending SIGTERM to pid={}", handle.instance, handle.pid);
    if let Err(e) = signal::kill(Pid::from_raw(handle.pid as i32), Signal::SIGTERM) {
        warn!("[{}] failed to send SIGTERM: {e}", handle.instance);
    }
}

#[cfg(not(unix))]
fn request_exit(handle: &mut ProcessHandle) {
    // No portable graceful signal; the grace loop falls through to kill.
    debug!("[{}] no graceful stop on this platform", handle.instance);
}

/// A leftover lock only means the previous process died uncleanly; remove it
/// and carry on.
fn clear_stale_locks(id: &InstanceId, profile_dir: &Path) {
    for rel in STALE_LOCKS {
        let lock = profile_dir.join(rel);
        if lock.exists() {
            warn!("[{id}] removing stale lock {}", lock.display());
            if let Err(e) = std::fs::remove_file(&lock) {
                warn!("[{id}] could not remove {}: {e}", lock.display());
            }
        }
    }
}

fn start_error(id: &InstanceId, reason: String) -> OfficeError {
    OfficeError::ProcessStart {
        instance: id.to_string(),
        reason,
    }
}

/// Resolve the office program. `auto` (or empty) checks `OFFICE_HOME`, then
/// the usual install locations, then falls back to `soffice` on PATH.
pub fn resolve_office_program(raw: &str) -> PathBuf {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("auto") {
        if let Some(p) = std::env::var("OFFICE_HOME")
            .ok()
            .and_then(|home| program_in_office_home(&expand_tilde(&home)))
        {
            return p;
        }
        for candidate in default_install_locations() {
            let p = PathBuf::from(candidate);
            if p.exists() {
                return p;
            }
        }
        return PathBuf::from("soffice");
    }
    expand_tilde(raw)
}

/// The office program inside an installation directory, if there is one.
pub fn program_in_office_home(home: &Path) -> Option<PathBuf> {
    ["program/soffice", "program/soffice.exe", "MacOS/soffice"]
        .iter()
        .map(|rel| home.join(rel))
        .find(|p| p.exists())
}

fn default_install_locations() -> &'static [&'static str] {
    if cfg!(target_os = "macos") {
        &["/Applications/LibreOffice.app/Contents/MacOS/soffice"]
    } else if cfg!(windows) {
        &[
            "C:\\Program Files\\LibreOffice\\program\\soffice.exe",
            "C:\\Program Files (x86)\\LibreOffice\\program\\soffice.exe",
        ]
    } else {
        &[
            "/usr/lib/libreoffice/program/soffice",
            "/usr/lib64/libreoffice/program/soffice",
            "/opt/libreoffice/program/soffice",
            "/usr/bin/soffice",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn args_are_expanded_per_instance() {
        let controller = LocalProcessController::new(ProcessSettings {
            work_dir: PathBuf::from("/tmp/op-work"),
            ..Default::default()
        });
        let endpoint = Endpoint::new(InstanceId::Port(2004), "127.0.0.1");
        let dir = controller.profile_dir(&endpoint.id);
        assert_eq!(dir, PathBuf::from("/tmp/op-work/profile_port_2004"));

        let args = controller.expand_args(&endpoint, &dir).unwrap();
        assert!(args.contains(&"--accept=socket,host=127.0.0.1,port=2004,tcpNoDelay=1;urp;".to_string()));
        assert!(args.iter().any(|a| a.starts_with("-env:UserInstallation=file://")
            && a.ends_with("profile_port_2004")));
    }

    #[test]
    fn explicit_program_is_kept() {
        assert_eq!(resolve_office_program("/opt/x/soffice"), PathBuf::from("/opt/x/soffice"));
    }
}
