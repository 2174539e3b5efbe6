//! Optional CLI for manual harness runs
//!
//! Usage: cargo run -p fdgrow-test-runner --bin runner -- target/debug/fdgrow share [count]

use std::env;
use std::process;

use fdgrow::ActorMode;
use fdgrow_test_runner::{markers, HarnessCommand};

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 3 || args.len() > 4 {
        eprintln!("Usage: {} <fdgrow-binary> <mode> [count]", args[0]);
        eprintln!("Available modes: copy, share, co-thread");
        process::exit(1);
    }

    let mode: ActorMode = match args[2].parse() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };
    let count = match args.get(3).map(|n| fdgrow::cli::parse_count(n)).transpose() {
        Ok(count) => count.unwrap_or(fdgrow::allocator::DEFAULT_PRESSURE),
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    let dir = env::temp_dir();
    let target = dir.join(format!("fdgrow-runner-{}.target", process::id()));
    println!("Running {} with {} descriptors", mode, count);

    let run = HarnessCommand::new(&args[1], mode, &target).count(count).run();
    let _ = std::fs::remove_file(&target);
    match run {
        Ok(run) => {
            print!("{}", run.stdout_str());
            for marker in markers::ALL {
                println!("{:<16} x{}", marker, run.count_pattern(marker));
            }
            if run.count_pattern(markers::PROBE_OK) == 0 {
                println!("actor write did not complete");
            }
            println!("exit status {}", run.status);
            let verdict = run.verdict();
            println!("{}", verdict);
            if !verdict.passed() {
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Run failed: {:#}", e);
            process::exit(1);
        }
    }
}
