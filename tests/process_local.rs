#![cfg(unix)]

use office_pool::error::OfficeError;
use office_pool::office::{
    Endpoint, InstanceId, LocalProcessController, ProcessController, ProcessSettings, StopMode,
};
use std::path::PathBuf;
use std::time::Duration;

fn controller(work_dir: &std::path::Path, program: &str, args: &[&str]) -> LocalProcessController {
    LocalProcessController::new(ProcessSettings {
        program: PathBuf::from(program),
        args: args.iter().map(|a| a.to_string()).collect(),
        work_dir: work_dir.to_path_buf(),
        env: Default::default(),
        stop_mode: StopMode::Terminate,
    })
}

fn endpoint() -> Endpoint {
    Endpoint::new(InstanceId::Port(2002), "127.0.0.1")
}

#[test]
fn graceful_stop_of_a_cooperative_process() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(dir.path(), "/bin/sleep", &["30"]);

    let mut handle = ctl.start(&endpoint()).unwrap();
    assert!(handle.pid() > 0);
    assert!(ctl.is_running(&mut handle));
    assert!(ctl.profile_dir(handle.instance()).is_dir());
    std::thread::sleep(Duration::from_millis(50));
    assert!(handle.uptime() >= Duration::from_millis(50));

    ctl.stop(&mut handle, Duration::from_secs(5)).unwrap();
    assert!(!ctl.is_running(&mut handle));
    ctl.stop(&mut handle, Duration::from_secs(5)).unwrap();
}

#[test]
fn stop_escalates_to_kill_and_reports_it() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(dir.path(), "/bin/sh", &["-c", "trap '' TERM; sleep 30"]);

    let mut handle = ctl.start(&endpoint()).unwrap();
    // Give the shell time to install its trap.
    std::thread::sleep(Duration::from_millis(200));

    let err = ctl.stop(&mut handle, Duration::from_millis(300)).unwrap_err();
    assert!(matches!(err, OfficeError::ProcessStop { .. }));
    assert!(!ctl.is_running(&mut handle));
}

#[test]
fn kill_is_immediate() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(dir.path(), "/bin/sleep", &["30"]);
    let mut handle = ctl.start(&endpoint()).unwrap();
    ctl.kill(&mut handle).unwrap();
    assert!(!ctl.is_running(&mut handle));
    ctl.kill(&mut handle).unwrap();
}

#[test]
fn stale_locks_are_cleared_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(dir.path(), "/bin/sleep", &["30"]);
    let profile = ctl.profile_dir(&InstanceId::Port(2002));
    std::fs::create_dir_all(profile.join("user")).unwrap();
    std::fs::write(profile.join(".lock"), b"stale").unwrap();
    std::fs::write(profile.join("user/.lock"), b"stale").unwrap();

    let mut handle = ctl.start(&endpoint()).unwrap();
    assert!(!profile.join(".lock").exists());
    assert!(!profile.join("user/.lock").exists());
    ctl.kill(&mut handle).unwrap();
}

#[test]
fn missing_program_is_a_start_error() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(dir.path(), "/nonexistent/soffice", &[]);
    assert!(matches!(
        ctl.start(&endpoint()),
        Err(OfficeError::ProcessStart { .. })
    ));
}
