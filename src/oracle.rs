//! Table-state oracle
//!
//! Read-only introspection of the calling context's descriptor table. The
//! Linux backend reads procfs and uses `kcmp(2)` to find every task that
//! shares the caller's files table. Growth and retirement happen inside the
//! kernel; this module only observes their effects.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::HarnessError;

/// Slots in a freshly created table (`NR_OPEN_DEFAULT` on 64-bit Linux).
pub const INLINE_CAPACITY: usize = 64;

/// Descriptors a snapshot holds open at the same time while it runs.
pub const SNAPSHOT_FD_RESERVE: usize = 1;

const KCMP_FILES: libc::c_int = 2;

/// Identity of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId {
    pub pid: i32,
    pub tid: i32,
}

impl ContextId {
    pub fn current() -> Self {
        let pid = unsafe { libc::getpid() };
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;
        ContextId { pid, tid }
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pid, self.tid)
    }
}

/// Identity of one descriptor table instance.
///
/// `leader` names the files table (lowest tid attached to it); `capacity`
/// distinguishes the successive tables installed by growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableId {
    pub leader: i32,
    pub capacity: usize,
}

impl TableId {
    /// `other` is this table or a table grown from it.
    pub fn is_same_or_successor(&self, other: &TableId) -> bool {
        self.leader == other.leader && other.capacity >= self.capacity
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.leader, self.capacity)
    }
}

impl FromStr for TableId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (leader, capacity) = s
            .split_once('/')
            .ok_or_else(|| format!("table id without '/': {}", s))?;
        Ok(TableId {
            leader: leader.parse().map_err(|_| format!("bad table leader: {}", leader))?,
            capacity: capacity
                .parse()
                .map_err(|_| format!("bad table capacity: {}", capacity))?,
        })
    }
}

/// Point-in-time observation of the caller's descriptor table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSnapshot {
    pub label: String,
    pub context: ContextId,
    pub threads: usize,
    /// Tasks attached to this table, `None` when sharing cannot be determined.
    pub owners: Option<usize>,
    pub capacity: usize,
    /// Descriptors open at the time of the snapshot, excluding the oracle's own.
    pub open: usize,
    pub table: TableId,
    /// Retired tables still reachable from this context.
    pub retired: Vec<TableId>,
}

impl TableSnapshot {
    /// Smallest number of further opens after which the table has grown by
    /// the time the next snapshot reads it: the free slots, less what the
    /// snapshot itself occupies, plus one.
    pub fn growth_threshold(&self) -> usize {
        self.capacity.saturating_sub(self.open + SNAPSHOT_FD_RESERVE) + 1
    }

    /// Retiring the table would be safe right now: a single owner with a
    /// single thread. Multi-threaded contexts never qualify, whatever the
    /// owner count says, since a sibling thread may be mid-access.
    pub fn sole_owner(&self) -> bool {
        self.threads == 1 && self.owners == Some(1)
    }
}

pub trait TableOracle: Send + Sync {
    fn name(&self) -> &'static str;

    /// Observe the calling context's table.
    fn snapshot(&self, label: &str) -> Result<TableSnapshot, HarnessError>;
}

/// Fields of `/proc/<pid>/status` the oracle needs.
#[derive(Debug, Default, PartialEq, Eq)]
struct StatusFields {
    pid: Option<i32>,
    threads: Option<usize>,
    fd_size: Option<usize>,
}

fn parse_status(text: &str) -> StatusFields {
    let mut fields = StatusFields::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "Pid" => fields.pid = value.parse().ok(),
            "Threads" => fields.threads = value.parse().ok(),
            "FDSize" => fields.fd_size = value.parse().ok(),
            _ => {}
        }
    }
    fields
}

fn numeric_entries(dir: &Path) -> io::Result<Vec<i32>> {
    // Collect before returning so the directory handle is closed again.
    let mut ids: Vec<i32> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
        .collect();
    ids.sort_unstable();
    Ok(ids)
}

fn kcmp_files(a: i32, b: i32) -> io::Result<bool> {
    let r = unsafe { libc::syscall(libc::SYS_kcmp, a, b, KCMP_FILES, 0usize, 0usize) };
    if r < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(r == 0)
    }
}

/// procfs + `kcmp(2)` backend.
pub struct ProcfsOracle {
    proc_root: PathBuf,
    kcmp: bool,
}

impl ProcfsOracle {
    /// Probe `proc_root` and `kcmp(2)`; fails when procfs lacks `FDSize`.
    pub fn probe(proc_root: impl Into<PathBuf>) -> Result<Self, HarnessError> {
        let proc_root = proc_root.into();
        let status = fs::read_to_string(proc_root.join("self/status")).map_err(|e| {
            HarnessError::OracleUnavailable(format!("{}/self/status: {}", proc_root.display(), e))
        })?;
        if parse_status(&status).fd_size.is_none() {
            return Err(HarnessError::OracleUnavailable(
                "procfs status has no FDSize field".into(),
            ));
        }

        let me = ContextId::current().tid;
        let kcmp = match kcmp_files(me, me) {
            Ok(_) => true,
            Err(e) => {
                log::warn!("kcmp(KCMP_FILES) unavailable ({}), owner counts will be unknown", e);
                false
            }
        };
        Ok(ProcfsOracle { proc_root, kcmp })
    }

    /// Every task, across all processes, attached to `me`'s files table.
    fn sharers(&self, me: i32) -> Option<Vec<i32>> {
        if !self.kcmp {
            return None;
        }
        let pids = numeric_entries(&self.proc_root).ok()?;
        let mut sharers = Vec::new();
        for pid in pids {
            // Processes vanish mid-scan; skip whatever cannot be read.
            let Ok(tids) = numeric_entries(&self.proc_root.join(pid.to_string()).join("task")) else {
                continue;
            };
            for tid in tids {
                if let Ok(true) = kcmp_files(me, tid) {
                    sharers.push(tid);
                }
            }
        }
        Some(sharers)
    }

    fn open_descriptors(&self) -> io::Result<usize> {
        let n = fs::read_dir(self.proc_root.join("self/fd"))?.count();
        // The listing includes the directory handle doing the listing.
        Ok(n.saturating_sub(1))
    }
}

impl TableOracle for ProcfsOracle {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn snapshot(&self, label: &str) -> Result<TableSnapshot, HarnessError> {
        let context = ContextId::current();
        let unavailable = |e: io::Error| HarnessError::OracleUnavailable(e.to_string());

        // One read of status gives a consistent pid/threads/capacity triple;
        // it is taken first so later scans cannot perturb the capacity seen.
        let status = parse_status(
            &fs::read_to_string(self.proc_root.join("self/status")).map_err(unavailable)?,
        );
        let capacity = status
            .fd_size
            .ok_or_else(|| HarnessError::OracleUnavailable("FDSize missing".into()))?;
        let threads = status.threads.unwrap_or(1);
        let open = self.open_descriptors().map_err(unavailable)?;

        let sharers = self.sharers(context.tid);
        let leader = sharers
            .as_ref()
            .and_then(|s| s.iter().copied().min())
            .unwrap_or(status.pid.unwrap_or(context.pid));

        Ok(TableSnapshot {
            label: label.to_string(),
            context,
            threads,
            owners: sharers.map(|s| s.len()),
            capacity,
            open,
            table: TableId { leader, capacity },
            // Linux retires old tables through RCU; none stay reachable.
            retired: Vec::new(),
        })
    }
}

/// Find the table-state facility of this system, once, at startup.
pub fn detect_oracle() -> Result<Arc<dyn TableOracle>, HarnessError> {
    let oracle = ProcfsOracle::probe("/proc")?;
    log::debug!("table-state oracle: {}", oracle.name());
    Ok(Arc::new(oracle))
}
