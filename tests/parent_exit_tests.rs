//! An actor whose parent is killed before releasing it must not hang.

use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use fdgrow::ActorMode;

const DEADLINE: Duration = Duration::from_secs(10);

fn wait_until<T>(what: &str, mut poll: impl FnMut() -> Option<T>) -> T {
    let start = Instant::now();
    loop {
        if let Some(v) = poll() {
            return v;
        }
        assert!(start.elapsed() < DEADLINE, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(50));
    }
}

/// Gone, or a zombie nobody has reaped yet.
fn exited(pid: i32) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .map_or(false, |(_, rest)| rest.trim_start().starts_with('Z')),
    }
}

fn actor_finishes_after_parent_is_killed(mode: ActorMode) {
    let dir = tempfile::tempdir().unwrap();
    let fifo = dir.path().join("filler.fifo");
    let log = dir.path().join("fdgrow.log");
    let target = dir.path().join("target");

    let c_fifo = CString::new(fifo.as_os_str().as_bytes()).unwrap();
    assert_eq!(unsafe { libc::mkfifo(c_fifo.as_ptr(), 0o600) }, 0);

    // Opening a FIFO with no writer blocks, so the parent never releases.
    let mut parent = Command::new(env!("CARGO_BIN_EXE_fdgrow"))
        .arg(mode.flag())
        .arg("--file")
        .arg(&target)
        .args(["--count", "1", "--filler"])
        .arg(&fifo)
        .arg("--log-file")
        .arg(&log)
        .env_remove("FDGROW_LOG")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let spawned = format!("spawned {} actor pid ", mode);
    let actor: i32 = wait_until("the actor to be spawned", || {
        let text = fs::read_to_string(&log).ok()?;
        let line = text.lines().find(|l| l.contains(&spawned))?;
        line.rsplit(' ').next()?.parse().ok()
    });
    wait_until("the parent to block on the filler", || {
        fs::read_to_string(&log)
            .ok()
            .filter(|t| t.contains("opening 1 file descriptors"))
    });

    parent.kill().unwrap();
    parent.wait().unwrap();

    wait_until("the orphaned actor to exit", || exited(actor).then_some(()));
    assert_eq!(fs::read(&target).unwrap(), b"testdata write\n");
    assert!(fs::read_to_string(&log).unwrap().contains("exited before releasing"));
}

#[test]
fn copy_actor_survives_parent_death() {
    actor_finishes_after_parent_is_killed(ActorMode::Copy);
}

#[test]
fn share_actor_survives_parent_death() {
    actor_finishes_after_parent_is_killed(ActorMode::Share);
}

