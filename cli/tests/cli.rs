use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use makejobs::TokenCoordinator;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

fn mkjobs(dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_mkjobs"));
    cmd.current_dir(dir)
        .env_remove("MAKE_JOBS")
        .env_remove("MAKE_JOBS_FIFO")
        .env_remove("__MKLVL__")
        .env_remove("RUST_LOG");
    cmd
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn wait_for(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !path.exists() {
        assert!(Instant::now() < deadline, "{} never appeared", path.display());
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn parallel_build() {
    let dir = tempfile::tempdir().unwrap();
    let out = mkjobs(dir.path())
        .args(["-j", "2", "a=echo made-a", "b=echo made-b", "c=@echo made-$@"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let text = stdout(&out);
    for needle in ["made-a\n", "made-b\n", "made-c\n"] {
        assert!(text.contains(needle), "{:?} missing from {:?}", needle, text);
    }
}

#[test]
fn failing_job_sets_exit_status() {
    let dir = tempfile::tempdir().unwrap();
    let out = mkjobs(dir.path())
        .args(["-j", "2", "bad=exit 3"])
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    assert!(stdout(&out).contains("*** Error code 3"));
}

#[test]
fn compat_mode_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let out = mkjobs(dir.path())
        .args(["-D", "WHO=world", "hello=echo hello $(WHO)"])
        .output()
        .unwrap();
    assert!(out.status.success());
    assert_eq!(stdout(&out), "echo hello world\nhello world\n");
}

#[test]
fn missing_recipe_stops() {
    let dir = tempfile::tempdir().unwrap();
    let out = mkjobs(dir.path())
        .args(["-j", "2", "--precious", "ghost"])
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("don't know how to make ghost. Stop"));
}

#[test]
fn runaway_recursion_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let out = mkjobs(dir.path())
        .env("__MKLVL__", "501")
        .arg("a=true")
        .output()
        .unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("max recursion level (500) exceeded"));
}

#[test]
fn interrupt_runs_hook_and_dies_by_signal() {
    let dir = tempfile::tempdir().unwrap();
    let started = dir.path().join("started");
    let log = dir.path().join("log");
    let mut child = mkjobs(dir.path())
        .args([
            "-j".to_string(),
            "2".to_string(),
            "--interrupt".to_string(),
            format!("echo cleanup >> {}", log.display()),
            format!("slow=touch {}; sleep 30", started.display()),
        ])
        .stdout(Stdio::null())
        .spawn()
        .unwrap();

    wait_for(&started);
    kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).unwrap();
    let status = child.wait().unwrap();

    assert_eq!(status.signal(), Some(Signal::SIGINT as i32));
    assert_eq!(fs::read_to_string(&log).unwrap(), "cleanup\n");
    assert!(!dir.path().join("slow").exists());
}

#[test]
fn second_interrupt_does_not_rerun_hook() {
    let dir = tempfile::tempdir().unwrap();
    let started = dir.path().join("started");
    let hooked = dir.path().join("hooked");
    let log = dir.path().join("log");
    let hook = format!(
        "echo cleanup >> {log}; touch {hooked}; sleep 1; echo finished >> {log}",
        log = log.display(),
        hooked = hooked.display()
    );
    let mut child = mkjobs(dir.path())
        .args([
            "-j".to_string(),
            "2".to_string(),
            "--interrupt".to_string(),
            hook,
            format!("slow=touch {}; sleep 30", started.display()),
        ])
        .stdout(Stdio::null())
        .spawn()
        .unwrap();

    let pid = Pid::from_raw(child.id() as i32);
    wait_for(&started);
    kill(pid, Signal::SIGINT).unwrap();
    wait_for(&hooked);
    kill(pid, Signal::SIGINT).unwrap();
    let status = child.wait().unwrap();

    assert_eq!(status.signal(), Some(Signal::SIGINT as i32));
    assert_eq!(fs::read_to_string(&log).unwrap(), "cleanup\nfinished\n");
}

#[test]
fn follows_a_parent_fifo() {
    let dir = tempfile::tempdir().unwrap();
    let fifo = dir.path().join("fifo");
    let mut parent = TokenCoordinator::leader(&fifo, 1).unwrap();

    let out = mkjobs(dir.path())
        .env("MAKE_JOBS_FIFO", &fifo)
        .args(["-s", "a=echo one", "b=echo two"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let mut lines: Vec<&str> = std::str::from_utf8(&out.stdout).unwrap().lines().collect();
    lines.sort();
    assert_eq!(lines, ["one", "two"]);

    // Whatever the child borrowed has been handed back.
    assert!(!parent.acquire(false));
    assert_eq!(parent.max_jobs(), 1);
    parent.teardown().unwrap();
}
