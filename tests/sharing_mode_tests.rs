//! Every sharing mode, end to end through the real binary.


use std::fs;

use fdgrow::observation::Observation;
use fdgrow::spawner::ActorExit;
use fdgrow::ActorMode;
use shared_run::{run_mode, Run};

const PRESSURE: usize = 61;

fn assert_clean(run: &Run, mode: ActorMode, count: usize) {
    assert_eq!(run.code(), Some(0), "{}", run.transcript());
    let verdict = run.verdict(mode, count);
    assert!(verdict.passed(), "{}\n{}", verdict, run.transcript());
    assert_eq!(fs::read(run.target()).unwrap(), b"testdata write\n");
}

fn probe_written(run: &Run) -> Option<usize> {
    run.observations().into_iter().find_map(|obs| match obs {
        Observation::Probe(p) if p.succeeded() => Some(p.written),
        _ => None,
    })
}

#[test]
fn copy_actor_writes_after_growth() {
    let run = run_mode(ActorMode::Copy, PRESSURE, &[]);
    assert_clean(&run, ActorMode::Copy, PRESSURE);
    assert_eq!(probe_written(&run), Some(15));

    let stdout = run.stdout();
    assert_eq!(stdout.matches("FDGROW:PROBE").count(), 1, "{}", stdout);
    assert!(stdout.contains("exit=exited:0"), "{}", stdout);
    assert!(stdout.contains("FDGROW:DONE mode=copy count=61"), "{}", stdout);
}

#[test]
fn share_actor_writes_after_growth() {
    let run = run_mode(ActorMode::Share, PRESSURE, &[]);
    assert_clean(&run, ActorMode::Share, PRESSURE);
    assert_eq!(probe_written(&run), Some(15));

    // The clone is attached to the parent's table, so it saw the growth.
    if let (Some(parent), Some(actor)) = (run.snapshot("1"), run.snapshot("actor")) {
        assert!(actor.capacity >= parent.capacity, "{}", run.transcript());
    }
}

#[test]
fn co_thread_actor_writes_after_growth() {
    let run = run_mode(ActorMode::CoThread, PRESSURE, &[]);
    assert_clean(&run, ActorMode::CoThread, PRESSURE);
    assert_eq!(probe_written(&run), Some(15));
    assert!(run.stdout().contains("exit=returned"), "{}", run.transcript());

    if let Some(actor) = run.snapshot("actor") {
        assert_eq!(actor.context.pid, run.snapshot("1").unwrap().context.pid);
        assert_ne!(actor.context.tid, actor.context.pid);
        assert!(actor.threads >= 2);
    }
}

#[test]
fn share_without_pressure_keeps_the_table() {
    let run = run_mode(ActorMode::Share, 0, &[]);
    assert_clean(&run, ActorMode::Share, 0);
    assert_eq!(probe_written(&run), Some(15));

    if let (Some(s0), Some(s1)) = (run.snapshot("0"), run.snapshot("1")) {
        assert_eq!(s0.table, s1.table, "{}", run.transcript());
    }
}

#[test]
fn copy_with_pressure_grows_only_the_parent() {
    let run = run_mode(ActorMode::Copy, PRESSURE, &[]);
    assert_clean(&run, ActorMode::Copy, PRESSURE);

    let (Some(s0), Some(s1), Some(actor)) =
        (run.snapshot("0"), run.snapshot("1"), run.snapshot("actor"))
    else {
        return;
    };
    if PRESSURE >= s0.growth_threshold() {
        assert_ne!(s0.table, s1.table, "{}", run.transcript());
        // The copy was taken before the growth phase.
        assert_eq!(actor.capacity, s0.capacity, "{}", run.transcript());
    }
    assert_eq!(actor.context.pid, actor.context.tid);
    assert_ne!(actor.context.pid, s1.context.pid);
}

#[test]
fn growth_threshold_is_exact() {
    let probe = run_mode(ActorMode::Share, 0, &[]);
    let Some(s0) = probe.snapshot("0") else {
        return;
    };
    let threshold = s0.growth_threshold();

    let below = run_mode(ActorMode::Share, threshold - 1, &[]);
    assert_clean(&below, ActorMode::Share, threshold - 1);
    let (b0, b1) = (below.snapshot("0").unwrap(), below.snapshot("1").unwrap());
    assert_eq!(b0.table, b1.table, "{}", below.transcript());

    let at = run_mode(ActorMode::Share, threshold, &[]);
    assert_clean(&at, ActorMode::Share, threshold);
    let (a0, a1) = (at.snapshot("0").unwrap(), at.snapshot("1").unwrap());
    assert_ne!(a0.table, a1.table, "{}", at.transcript());
    assert!(a1.capacity > a0.capacity);
}

#[test]
fn fixed_delay_still_completes() {
    for mode in ActorMode::ALL {
        let run = run_mode(mode, PRESSURE, &["--sync", "delay", "--delay-ms", "300"]);
        assert_eq!(run.code(), Some(0), "{}", run.transcript());
        assert!(run.stderr().contains("best-effort"), "{}", run.transcript());
        assert_eq!(probe_written(&run), Some(15), "{}", run.transcript());
        assert!(run
            .observations()
            .iter()
            .any(|o| matches!(o, Observation::Actor { exit, .. } if exit.is_clean())));
    }
}

#[test]
fn every_mode_reports_in_order() {
    for mode in ActorMode::ALL {
        let run = run_mode(mode, PRESSURE, &[]);
        let kinds: Vec<&str> = run
            .observations()
            .iter()
            .map(Observation::kind)
            .filter(|k| *k != "SNAPSHOT")
            .collect();
        assert_eq!(kinds, ["PROBE", "ACTOR", "TARGET", "DONE"], "{}", run.transcript());

        let exit = run.observations().into_iter().find_map(|o| match o {
            Observation::Actor { exit, .. } => Some(exit),
            _ => None,
        });
        let expected = match mode {
            ActorMode::CoThread => ActorExit::Returned,
            _ => ActorExit::Exited(0),
        };
        assert_eq!(exit, Some(expected));
    }
}
