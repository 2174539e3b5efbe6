//! Command-line surface.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgGroup, Parser, ValueEnum};
use log::LevelFilter;

use crate::allocator::{DEFAULT_FILLER, DEFAULT_PRESSURE};
use crate::config::{default_log_file, HarnessConfig};
use crate::error::HarnessError;
use crate::spawner::ActorMode;
use crate::sync::{SyncStrategy, DEFAULT_DELAY};

/// Ordering between the parent's growth phase and the actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SyncKind {
    /// Sleep `--delay-ms`, then proceed (historical, race-prone)
    Delay,
    /// Block until the parent signals it is done
    Rendezvous,
}

#[derive(Parser, Debug)]
#[command(name = "fdgrow")]
#[command(about = "Check that a descriptor opened before fork/clone/thread spawn stays writable after the table grows")]
#[command(version)]
#[command(group(ArgGroup::new("mode").required(true).args(["copy", "share", "co_thread"])))]
pub struct Args {
    /// Fork: the child gets a copy of the descriptor table
    #[arg(short = 'c', long)]
    pub copy: bool,

    /// Clone a process that shares the descriptor table
    #[arg(short = 's', long)]
    pub share: bool,

    /// Spawn a thread in this process
    #[arg(short = 't', long)]
    pub co_thread: bool,

    /// File to open and test writes to (created, truncated)
    #[arg(short = 'f', long, value_name = "FILE")]
    pub file: PathBuf,

    /// Descriptors to open to force the table to grow
    #[arg(short = 'n', long, value_name = "N", value_parser = parse_count, default_value_t = DEFAULT_PRESSURE)]
    pub count: usize,

    /// File opened repeatedly for descriptor pressure
    #[arg(long, value_name = "PATH", default_value = DEFAULT_FILLER)]
    pub filler: PathBuf,

    /// How the actor waits for the parent's growth phase
    #[arg(long, value_enum, default_value_t = SyncKind::Rendezvous)]
    pub sync: SyncKind,

    /// Actor head-start delay with `--sync delay`
    #[arg(long, value_name = "MS", default_value_t = DEFAULT_DELAY.as_millis() as u64)]
    pub delay_ms: u64,

    /// Durable log shared by parent and actor [default: $TMPDIR/fdgrow-<pid>.log]
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Console log level
    #[arg(long, env = "FDGROW_LOG", value_name = "LEVEL", default_value = "warn")]
    pub log_level: LevelFilter,

    /// Raise the console log level (repeatable)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Non-negative descriptor count; `0x` and `0` prefixes select hex and octal.
pub fn parse_count(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        usize::from_str_radix(&s[1..], 8)
    } else {
        s.parse()
    };
    parsed.map_err(|_| format!("'{}' is not a non-negative descriptor count", s))
}

impl Args {
    pub fn mode(&self) -> Result<ActorMode, HarnessError> {
        match (self.copy, self.share, self.co_thread) {
            (true, false, false) => Ok(ActorMode::Copy),
            (false, true, false) => Ok(ActorMode::Share),
            (false, false, true) => Ok(ActorMode::CoThread),
            _ => Err(HarnessError::Argument(
                "exactly one of --copy, --share or --co-thread is required".into(),
            )),
        }
    }

    fn console_level(&self) -> LevelFilter {
        let bumped = self.log_level as usize + self.verbose as usize;
        LevelFilter::iter()
            .nth(bumped)
            .unwrap_or(LevelFilter::Trace)
    }

    /// Validate into a run configuration. Opens nothing.
    pub fn into_config(self) -> Result<HarnessConfig, HarnessError> {
        let mut config = HarnessConfig::new(self.mode()?, self.file.clone());
        config.count = self.count;
        config.filler = self.filler.clone();
        config.sync = match self.sync {
            SyncKind::Delay => SyncStrategy::FixedDelay(Duration::from_millis(self.delay_ms)),
            SyncKind::Rendezvous => SyncStrategy::Rendezvous,
        };
        config.log_file = self.log_file.clone().unwrap_or_else(default_log_file);
        config.console_level = self.console_level();
        config.validate()?;
        Ok(config)
    }
}
