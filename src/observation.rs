//! Observation lines.
//!
//! Everything a run wants compared afterwards is printed as one
//! `FDGROW:<KIND> key=value ...` line, on stdout and in the durable log.
//! The same text parses back into an [`Observation`], which is how actor
//! processes report to the parent and how external checkers read a run.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::oracle::{ContextId, TableId, TableSnapshot};
use crate::spawner::{ActorExit, ActorMode};

pub const PREFIX: &str = "FDGROW:";

/// Result of the actor's write probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRecord {
    pub context: ContextId,
    pub written: usize,
    /// `None` on success, `Some(errno)` on failure (`Some(None)` when the
    /// failure carried no OS error).
    pub error: Option<Option<i32>>,
}

impl ProbeRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// What the target file held once the actor was done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetCheck {
    pub bytes: usize,
    pub matches: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Snapshot(TableSnapshot),
    Probe(ProbeRecord),
    Actor { pid: i32, exit: ActorExit },
    Target(TargetCheck),
    Done { mode: ActorMode, count: usize },
}

impl Observation {
    pub fn kind(&self) -> &'static str {
        match self {
            Observation::Snapshot(_) => "SNAPSHOT",
            Observation::Probe(_) => "PROBE",
            Observation::Actor { .. } => "ACTOR",
            Observation::Target(_) => "TARGET",
            Observation::Done { .. } => "DONE",
        }
    }
}

fn write_opt<T: fmt::Display>(f: &mut fmt::Formatter<'_>, v: &Option<T>, none: &str) -> fmt::Result {
    match v {
        Some(v) => write!(f, "{}", v),
        None => f.write_str(none),
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PREFIX, self.kind())?;
        match self {
            Observation::Snapshot(s) => {
                write!(
                    f,
                    " label={} pid={} tid={} threads={} owners=",
                    s.label, s.context.pid, s.context.tid, s.threads
                )?;
                write_opt(f, &s.owners, "?")?;
                write!(f, " capacity={} open={} table={} retired=", s.capacity, s.open, s.table)?;
                if s.retired.is_empty() {
                    f.write_str("-")
                } else {
                    let ids: Vec<String> = s.retired.iter().map(|t| t.to_string()).collect();
                    f.write_str(&ids.join(","))
                }
            }
            Observation::Probe(p) => {
                write!(
                    f,
                    " pid={} tid={} written={} status=",
                    p.context.pid, p.context.tid, p.written
                )?;
                match p.error {
                    None => f.write_str("ok"),
                    Some(errno) => {
                        f.write_str("err:")?;
                        write_opt(f, &errno, "-")
                    }
                }
            }
            Observation::Actor { pid, exit } => write!(f, " pid={} exit={}", pid, exit),
            Observation::Target(t) => write!(f, " bytes={} matches={}", t.bytes, t.matches),
            Observation::Done { mode, count } => write!(f, " mode={} count={}", mode, count),
        }
    }
}

struct Fields<'a>(HashMap<&'a str, &'a str>);

impl<'a> Fields<'a> {
    fn parse(rest: &'a str) -> Self {
        Fields(
            rest.split_whitespace()
                .filter_map(|kv| kv.split_once('='))
                .collect(),
        )
    }

    fn raw(&self, key: &str) -> Result<&'a str, String> {
        self.0
            .get(key)
            .copied()
            .ok_or_else(|| format!("missing field '{}'", key))
    }

    fn get<T: FromStr>(&self, key: &str) -> Result<T, String> {
        let raw = self.raw(key)?;
        raw.parse()
            .map_err(|_| format!("bad value for '{}': {}", key, raw))
    }

    fn context(&self) -> Result<ContextId, String> {
        Ok(ContextId {
            pid: self.get("pid")?,
            tid: self.get("tid")?,
        })
    }
}

impl FromStr for Observation {
    type Err = String;

    /// Parses the first `FDGROW:` record found in `s`, so log lines with a
    /// logger prefix parse as well.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let start = s
            .find(PREFIX)
            .ok_or_else(|| format!("no {} record", PREFIX))?;
        let record = &s[start + PREFIX.len()..];
        let (kind, rest) = record.split_once(' ').unwrap_or((record, ""));
        let fields = Fields::parse(rest);

        match kind {
            "SNAPSHOT" => {
                let owners = match fields.raw("owners")? {
                    "?" => None,
                    n => Some(n.parse().map_err(|_| format!("bad owners: {}", n))?),
                };
                let retired = match fields.raw("retired")? {
                    "-" => Vec::new(),
                    ids => ids
                        .split(',')
                        .map(TableId::from_str)
                        .collect::<Result<_, _>>()?,
                };
                Ok(Observation::Snapshot(TableSnapshot {
                    label: fields.raw("label")?.to_string(),
                    context: fields.context()?,
                    threads: fields.get("threads")?,
                    owners,
                    capacity: fields.get("capacity")?,
                    open: fields.get("open")?,
                    table: fields.get("table")?,
                    retired,
                }))
            }
            "PROBE" => {
                let error = match fields.raw("status")? {
                    "ok" => None,
                    "err:-" => Some(None),
                    status => {
                        let errno = status
                            .strip_prefix("err:")
                            .and_then(|e| e.parse().ok())
                            .ok_or_else(|| format!("bad probe status: {}", status))?;
                        Some(Some(errno))
                    }
                };
                Ok(Observation::Probe(ProbeRecord {
                    context: fields.context()?,
                    written: fields.get("written")?,
                    error,
                }))
            }
            "ACTOR" => Ok(Observation::Actor {
                pid: fields.get("pid")?,
                exit: fields.get("exit")?,
            }),
            "TARGET" => Ok(Observation::Target(TargetCheck {
                bytes: fields.get("bytes")?,
                matches: fields.get("matches")?,
            })),
            "DONE" => Ok(Observation::Done {
                mode: fields.get("mode")?,
                count: fields.get("count")?,
            }),
            other => Err(format!("unknown observation kind: {}", other)),
        }
    }
}

/// Print an observation on stdout and record it in the log.
pub fn emit(obs: &Observation) {
    use std::io::Write;

    let line = obs.to_string();
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{}", line);
    let _ = out.flush();
    log::info!("{}", line);
}

/// Every observation in `text`, in order. Other lines are ignored.
pub fn parse_all(text: &str) -> Vec<Observation> {
    text.lines()
        .filter(|l| l.contains(PREFIX))
        .filter_map(|l| l.parse().ok())
        .collect()
}
