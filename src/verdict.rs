//! External pass/fail judgement over a run's observations.
//!
//! The harness only reports; this module compares what it reported against
//! the sharing semantics expected for the mode. Checks whose inputs are
//! missing (no oracle, no `kcmp`) are skipped rather than failed.

use std::fmt;

use crate::observation::{Observation, ProbeRecord, TargetCheck};
use crate::oracle::TableSnapshot;
use crate::spawner::{ActorExit, ActorMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Pass,
    Fail(String),
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: &'static str,
    pub outcome: CheckOutcome,
}

#[derive(Debug, Clone)]
pub struct Verdict {
    pub mode: ActorMode,
    pub checks: Vec<Check>,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        !self
            .checks
            .iter()
            .any(|c| matches!(c.outcome, CheckOutcome::Fail(_)))
    }

    pub fn check(&self, name: &str) -> Option<&CheckOutcome> {
        self.checks.iter().find(|c| c.name == name).map(|c| &c.outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Check> {
        self.checks
            .iter()
            .filter(|c| matches!(c.outcome, CheckOutcome::Fail(_)))
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for check in &self.checks {
            match &check.outcome {
                CheckOutcome::Pass => writeln!(f, "check {} ... ok", check.name)?,
                CheckOutcome::Fail(why) => writeln!(f, "check {} ... FAILED: {}", check.name, why)?,
                CheckOutcome::Skipped(why) => writeln!(f, "check {} ... skipped: {}", check.name, why)?,
            }
        }
        write!(
            f,
            "verdict for {}: {}",
            self.mode,
            if self.passed() { "ok" } else { "FAILED" }
        )
    }
}

/// The pieces of a run the checks look at.
#[derive(Default)]
struct RunView<'a> {
    parent: Vec<&'a TableSnapshot>,
    actor: Option<&'a TableSnapshot>,
    probe: Option<&'a ProbeRecord>,
    exit: Option<ActorExit>,
    target: Option<&'a TargetCheck>,
    done: bool,
}

impl<'a> RunView<'a> {
    fn new(observations: &'a [Observation]) -> Self {
        let mut view = RunView::default();
        for obs in observations {
            match obs {
                Observation::Snapshot(s) if s.label == "actor" => view.actor = Some(s),
                Observation::Snapshot(s) => view.parent.push(s),
                Observation::Probe(p) => view.probe = Some(p),
                Observation::Actor { exit, .. } => view.exit = Some(*exit),
                Observation::Target(t) => view.target = Some(t),
                Observation::Done { .. } => view.done = true,
            }
        }
        view
    }

    fn parent(&self, label: &str) -> Option<&'a TableSnapshot> {
        self.parent.iter().copied().find(|s| s.label == label)
    }
}

fn pass(name: &'static str) -> Check {
    Check { name, outcome: CheckOutcome::Pass }
}

fn fail(name: &'static str, why: impl Into<String>) -> Check {
    Check { name, outcome: CheckOutcome::Fail(why.into()) }
}

fn skip(name: &'static str, why: impl Into<String>) -> Check {
    Check { name, outcome: CheckOutcome::Skipped(why.into()) }
}

fn completion(view: &RunView) -> Check {
    const NAME: &str = "completion";
    match (view.exit, view.done) {
        (Some(exit), true) if exit.is_clean() => pass(NAME),
        (Some(exit), _) if !exit.is_clean() => fail(NAME, format!("actor {}", exit)),
        (None, _) => fail(NAME, "no actor exit recorded"),
        _ => fail(NAME, "parent did not reach Done"),
    }
}

fn probe_bytes(view: &RunView, payload_len: usize) -> Check {
    const NAME: &str = "probe-bytes";
    match view.probe {
        None => fail(NAME, "actor reported no probe result"),
        Some(p) if p.succeeded() && p.written == payload_len => pass(NAME),
        Some(p) if p.succeeded() => fail(
            NAME,
            format!("reported success after {} of {} bytes", p.written, payload_len),
        ),
        Some(p) if p.written >= payload_len => fail(
            NAME,
            format!("reported failure after writing all {} bytes", p.written),
        ),
        Some(p) => fail(
            NAME,
            format!(
                "write failed after {} of {} bytes (errno {:?})",
                p.written,
                payload_len,
                p.error.flatten()
            ),
        ),
    }
}

fn target_content(view: &RunView) -> Check {
    const NAME: &str = "target-content";
    match view.target {
        None => skip(NAME, "target not read back"),
        Some(t) if t.matches => pass(NAME),
        Some(t) => fail(NAME, format!("target holds {} bytes, not the payload", t.bytes)),
    }
}

fn growth(view: &RunView, count: usize) -> Check {
    const NAME: &str = "growth";
    let (Some(s0), Some(s1)) = (view.parent("0"), view.parent("1")) else {
        return skip(NAME, "parent snapshots missing");
    };
    let threshold = s0.growth_threshold();
    let grew = s1.table != s0.table;
    match (count >= threshold, grew) {
        (true, true) | (false, false) => pass(NAME),
        (true, false) => fail(
            NAME,
            format!("{} opens (threshold {}) left table {} in place", count, threshold, s0.table),
        ),
        (false, true) => fail(
            NAME,
            format!(
                "{} opens (threshold {}) replaced table {} with {}",
                count, threshold, s0.table, s1.table
            ),
        ),
    }
}

/// Whether two snapshots can name distinct tables by leader, not just size.
fn leaders_known(a: &TableSnapshot, b: &TableSnapshot) -> bool {
    a.owners.is_some() && b.owners.is_some()
}

fn sharing(view: &RunView, mode: ActorMode) -> Vec<Check> {
    const NAME: &str = "table-identity";
    let (Some(parent), Some(actor)) = (view.parent("1").or_else(|| view.parent("0")), view.actor)
    else {
        return vec![skip(NAME, "snapshots missing")];
    };
    let mut checks = Vec::new();

    match mode {
        ActorMode::Copy => {
            let distinct = if leaders_known(parent, actor) {
                Some(parent.table != actor.table)
            } else if parent.capacity != actor.capacity {
                Some(true)
            } else {
                None
            };
            checks.push(match distinct {
                Some(true) => pass(NAME),
                Some(false) => fail(NAME, format!("copy still uses parent table {}", parent.table)),
                None => skip(NAME, "tables indistinguishable without kcmp"),
            });
            checks.push(match actor.owners {
                Some(1) => pass("copy-owners"),
                Some(n) => fail("copy-owners", format!("private copy has {} owners", n)),
                None => skip("copy-owners", "owner count unknown"),
            });
        }
        ActorMode::Share | ActorMode::CoThread => {
            let follows = if leaders_known(parent, actor) {
                parent.table.is_same_or_successor(&actor.table)
            } else {
                actor.capacity >= parent.capacity
            };
            checks.push(if follows {
                pass(NAME)
            } else {
                fail(
                    NAME,
                    format!("actor sees table {}, parent {}", actor.table, parent.table),
                )
            });
            checks.push(match parent.owners {
                Some(n) if n >= 2 => pass("shared-owners"),
                Some(n) => fail("shared-owners", format!("{} owners while both are attached", n)),
                None => skip("shared-owners", "owner count unknown"),
            });
            if mode == ActorMode::CoThread {
                let threads = parent.threads.min(actor.threads);
                checks.push(if threads >= 2 {
                    pass("co-thread-threads")
                } else {
                    fail("co-thread-threads", format!("only {} thread(s) seen", threads))
                });
                checks.push(if actor.sole_owner() {
                    fail("co-thread-not-sole", "table looks safe to free with a live sibling")
                } else {
                    pass("co-thread-not-sole")
                });
            }
        }
    }
    checks
}

/// Judge a run of `mode` with `count` pressure descriptors.
pub fn evaluate(
    mode: ActorMode,
    count: usize,
    payload_len: usize,
    observations: &[Observation],
) -> Verdict {
    let view = RunView::new(observations);
    let mut checks = vec![
        completion(&view),
        probe_bytes(&view, payload_len),
        target_content(&view),
        growth(&view, count),
    ];
    checks.extend(sharing(&view, mode));
    Verdict { mode, checks }
}
