//! fdgrow harness runner
//!
//! Runs the harness binary for one sharing mode under a hard timeout,
//! captures its output and judges the observations it printed.

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use fdgrow::observation::{parse_all, Observation};
use fdgrow::probe::DEFAULT_PAYLOAD;
use fdgrow::verdict::{self, Verdict};
use fdgrow::ActorMode;

/// Prefixes of the observation lines the harness prints.
pub mod markers {
    pub const SNAPSHOT: &str = "FDGROW:SNAPSHOT";
    pub const PROBE: &str = "FDGROW:PROBE";
    pub const PROBE_OK: &str = "status=ok";
    pub const ACTOR: &str = "FDGROW:ACTOR";
    pub const TARGET: &str = "FDGROW:TARGET";
    pub const TARGET_OK: &str = "FDGROW:TARGET bytes=15 matches=true";
    pub const DONE: &str = "FDGROW:DONE";

    /// Every line prefix, in the order a complete run prints them.
    pub const ALL: [&str; 5] = [SNAPSHOT, PROBE, ACTOR, TARGET, DONE];
}

/// Longest a single harness run may take before it is killed.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Output of one harness run, with helper methods
pub struct HarnessRun {
    pub mode: ActorMode,
    pub count: usize,
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl HarnessRun {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Assert that a marker appears in the harness output
    pub fn assert_marker(&self, marker: &str) {
        let stdout = self.stdout_str();
        assert!(
            stdout.contains(marker),
            "marker '{}' not found in harness output:\n{}\nstderr:\n{}",
            marker,
            stdout,
            self.stderr_str()
        );
    }

    pub fn count_pattern(&self, pattern: &str) -> usize {
        self.stdout_str().matches(pattern).count()
    }

    /// Assert that a pattern appears exactly N times
    pub fn assert_count(&self, pattern: &str, expected: usize) {
        let actual = self.count_pattern(pattern);
        assert_eq!(
            actual,
            expected,
            "expected {} occurrences of '{}', found {} in:\n{}",
            expected,
            pattern,
            actual,
            self.stdout_str()
        );
    }

    pub fn observations(&self) -> Vec<Observation> {
        parse_all(&self.stdout_str())
    }

    /// Judge the run against the semantics of its mode.
    pub fn verdict(&self) -> Verdict {
        verdict::evaluate(self.mode, self.count, DEFAULT_PAYLOAD.len(), &self.observations())
    }
}

/// Builder for one invocation of the harness binary.
pub struct HarnessCommand {
    binary: PathBuf,
    mode: ActorMode,
    target: PathBuf,
    count: usize,
    log_file: Option<PathBuf>,
    extra: Vec<String>,
    timeout: Duration,
}

impl HarnessCommand {
    pub fn new(binary: impl Into<PathBuf>, mode: ActorMode, target: impl Into<PathBuf>) -> Self {
        HarnessCommand {
            binary: binary.into(),
            mode,
            target: target.into(),
            count: fdgrow::allocator::DEFAULT_PRESSURE,
            log_file: None,
            extra: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.extra.push(arg.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(self.mode.flag())
            .arg("--file")
            .arg(&self.target)
            .arg("--count")
            .arg(self.count.to_string());
        if let Some(log) = &self.log_file {
            cmd.arg("--log-file").arg(log);
        }
        cmd.args(&self.extra)
            .env_remove("FDGROW_LOG")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group, so a wedged actor dies with its parent.
            .process_group(0);
        cmd
    }

    /// Run to completion or until the timeout, whichever comes first.
    pub fn run(&self) -> Result<HarnessRun> {
        let mut child = self
            .command()
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.binary.display()))?;
        let pgid = child.id();

        let stdout = child.stdout.take().context("stdout not captured")?;
        let stderr = child.stderr.take().context("stderr not captured")?;
        let stdout = thread::spawn(move || drain(stdout));
        let stderr = thread::spawn(move || drain(stderr));

        let start = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait().context("Failed to poll harness")? {
                break status;
            }
            if start.elapsed() > self.timeout {
                kill_group(pgid);
                let _ = child.wait();
                anyhow::bail!(
                    "{} run timed out after {}s",
                    self.mode,
                    self.timeout.as_secs()
                );
            }
            thread::sleep(Duration::from_millis(20));
        };

        // A surviving actor may still hold the pipes open; reap the group.
        kill_group(pgid);
        Ok(HarnessRun {
            mode: self.mode,
            count: self.count,
            status,
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        })
    }
}

fn drain(mut pipe: impl Read) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf);
    buf
}

fn kill_group(pgid: u32) {
    // ESRCH once the whole group has exited.
    unsafe {
        libc::kill(-(pgid as libc::pid_t), libc::SIGKILL);
    }
}
