use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use time::OffsetDateTime;
use traffic_replay::config::{parse_duration, FileInputConfig, DEFAULT_READ_DEPTH};
use traffic_replay::input_file::FileInput;
use traffic_replay::protocol::decode_meta;
use traffic_replay::{logging, Error, RecordSource};

#[derive(Debug, Parser)]
#[command(about = "Read a capture file set in replay order and summarize it")]
struct Args {
    /// Capture file glob to read (e.g. "captures/requests_*.gor")
    #[arg(long, short = 'i')]
    input: String,

    /// Records read ahead and sorted per file
    #[arg(long, default_value_t = DEFAULT_READ_DEPTH)]
    read_depth: usize,

    /// Cap applied to each gap when estimating replay time (0 = no cap)
    #[arg(long, default_value = "0", value_parser = parse_duration)]
    max_wait: Duration,

    /// Print every record header as it is read
    #[arg(long, default_value_t = false)]
    dump: bool,

    /// Increase log verbosity
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

fn wall_clock(ns: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(ns as i128)
        .map(|t| t.to_string())
        .unwrap_or_else(|_| format!("{ns}ns"))
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let config = FileInputConfig { loop_input: false, read_depth: args.read_depth, max_wait: args.max_wait, dry_run: true };
    let input = FileInput::new(&args.input, config).with_context(|| format!("open {:?}", args.input))?;
    let files = input.paths();

    loop {
        match input.pull() {
            Ok(msg) => {
                if args.dump {
                    let fields: Vec<_> = decode_meta(&msg.meta).iter().map(|f| String::from_utf8_lossy(f).into_owned()).collect();
                    println!("{} | {} bytes", fields.join(" "), msg.data.len());
                }
            }
            Err(Error::EndOfStream) => break,
            Err(e) => return Err(e).context("read capture"),
        }
    }

    let stats = input.stats();
    println!("files:              {}", files.len());
    for f in &files {
        println!("  {}", f.display());
    }
    println!("records:            {}", stats.records);
    println!("  requests:         {}", stats.requests);
    println!("  responses:        {}", stats.responses);
    println!("  replayed:         {}", stats.replayed_responses);
    println!("  malformed:        {}", stats.malformed);
    if let (Some(first), Some(last)) = (stats.first_timestamp, stats.last_timestamp) {
        println!("first record at:    {}", wall_clock(first));
        println!("last record at:     {}", wall_clock(last));
    }
    println!("expected replay:    {:?}", stats.expected_duration);
    Ok(())
}
