//! Trace Replay
//!
//! Feeds a recorded trace through a `forkbridge` session, as if a traced host
//! program produced it. Run it under `afl-fuzz` to check a fuzzer setup end to
//! end: the trace is the fuzz input, its records become coverage, and
//! `!raise` records of a `--crash-on` class become crashes.
//!
//! A trace holds one record per line:
//!
//! ```text
//! lib/parser.rb:120
//! !raise IOError::EOFError
//! ```
//!
//! Blank lines, `#` comments and malformed records are skipped.

use std::{
    borrow::Cow,
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
};

use clap::Parser;
use forkbridge::{BridgeConfig, Error, KindOf, LoopLimit, NopTraceHook, Session};

#[derive(Parser, Debug)]
#[command(
    name = "trace_replay",
    author,
    version,
    about,
    long_about = "Replays a scope trace through forkbridge, for use as an afl-fuzz target"
)]
pub struct Opt {
    #[arg(help = "The trace to replay, read from stdin if omitted")]
    pub input: Option<PathBuf>,
    #[arg(
        short,
        long,
        help = "Run in persistent mode, replaying the input this many times per process"
    )]
    pub persistent: Option<u64>,
    #[arg(long = "crash-on", help = "Raised classes that crash the process")]
    pub crash_on: Vec<String>,
    #[arg(long, help = "Raised classes that never crash the process")]
    pub ignore: Vec<String>,
    #[arg(short, long, default_value_t = libc::SIGABRT, help = "Signal to crash with")]
    pub signal: i32,
}

/// One line of a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Record {
    Scope(String, u32),
    Raise(String),
}

/// A class path like `IOError::EOFError`, kind of each of its prefixes.
struct RaisedClass<'a>(&'a str);

impl KindOf<String> for RaisedClass<'_> {
    fn is_kind_of(&self, class: &String) -> bool {
        self.0
            .strip_prefix(class.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
    }

    fn class_name(&self) -> Cow<'_, str> {
        Cow::Borrowed(self.0)
    }
}

fn parse_record(line: &str) -> Option<Record> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    if let Some(class) = line.strip_prefix("!raise") {
        let class = class.trim();
        return (!class.is_empty()).then(|| Record::Raise(class.to_string()));
    }
    let (path, lineno) = line.rsplit_once(':')?;
    Some(Record::Scope(path.to_string(), lineno.parse().ok()?))
}

fn parse_trace(text: &str) -> Vec<Record> {
    text.lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            let record = parse_record(line);
            if record.is_none() && !line.trim().is_empty() && !line.trim().starts_with('#') {
                log::debug!("Skipping malformed record on line {}: {line:?}", idx + 1);
            }
            record
        })
        .collect()
}

fn read_input(input: Option<&Path>) -> Result<Vec<u8>, Error> {
    match input {
        Some(path) => Ok(fs::read(path)?),
        None => {
            let mut buf = Vec::new();
            io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}

fn replay(session: &mut Session<NopTraceHook, String>, input: Option<&Path>) -> Result<(), Error> {
    let bytes = read_input(input)?;
    let records = parse_trace(&String::from_utf8_lossy(&bytes));
    log::info!("Replaying {} records", records.len());
    for record in &records {
        match record {
            Record::Scope(path, line) => session.on_scope_event(path.as_bytes(), *line),
            Record::Raise(class) => {
                session.on_raise(&RaisedClass(class))?;
            }
        }
    }
    Ok(())
}

fn run(opts: &Opt) -> Result<(), Error> {
    let mut session = Session::new(BridgeConfig::from_env()?, NopTraceHook)?;
    if !opts.crash_on.is_empty() {
        session.configure_crash_policy(
            Some(opts.crash_on.clone()),
            Some(opts.ignore.clone()),
            Some(opts.signal),
        )?;
    }

    let input = opts.input.as_deref();
    match opts.persistent {
        Some(runs) => {
            while session.persistent_loop(LoopLimit::Limited(runs))? {
                replay(&mut session, input)?;
            }
        }
        None => {
            session.init()?;
            replay(&mut session, input)?;
        }
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    env_logger::init();
    let opts = Opt::parse();

    match run(&opts) {
        Err(Error::ShuttingDown) => {
            log::info!("Fuzzer asked us to stop");
            Ok(())
        }
        res => res,
    }
}
