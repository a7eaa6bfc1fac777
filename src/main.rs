use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use crossbeam_channel::{after, bounded, never, select, tick};
use dotenvy::dotenv;
use std::time::Duration;
use tracing::info;
use traffic_replay::config::{
    parse_duration, parse_size, FileInputConfig, FileOutputConfig, Settings, DEFAULT_QUEUE_LIMIT, DEFAULT_READ_DEPTH,
};
use traffic_replay::emitter::Emitter;
use traffic_replay::logging;
use traffic_replay::plugins::Plugins;

#[derive(Debug, Parser)]
#[command(version, about = "Replay captured traffic files in original order and timing")]
struct Args {
    /// Capture file glob to replay, optionally suffixed with `|limit` (e.g. `requests_*.gor|100/s`)
    #[arg(long, env = "INPUT_FILE", value_delimiter = ',')]
    input_file: Vec<String>,

    /// Loop input files, useful for performance testing
    #[arg(long, default_value_t = false)]
    input_file_loop: bool,

    /// Records read ahead and sorted per file
    #[arg(long, default_value_t = DEFAULT_READ_DEPTH)]
    input_file_read_depth: usize,

    /// Maximum pause between two records (0 = no cap)
    #[arg(long, default_value = "0", value_parser = parse_duration)]
    input_file_max_wait: Duration,

    /// Read through the inputs without pausing and report the expected replay time
    #[arg(long, default_value_t = false)]
    input_file_dry_run: bool,

    /// Capture file to write, optionally suffixed with `|limit`; `.gz` enables compression
    #[arg(long, env = "OUTPUT_FILE", value_delimiter = ',')]
    output_file: Vec<String>,

    /// Size of each output shard before rotating
    #[arg(long, default_value = "32mb", value_parser = parse_size)]
    output_file_size_limit: u64,

    /// Total size across all shards of one output, after which records are dropped
    #[arg(long, default_value = "1tb", value_parser = parse_size)]
    output_file_max_size: u64,

    /// How often buffered output is flushed to disk
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    output_file_flush_interval: Duration,

    /// Append to existing output shards instead of truncating
    #[arg(long, default_value_t = false)]
    output_file_append: bool,

    /// Records queued per output before writers block
    #[arg(long, default_value_t = DEFAULT_QUEUE_LIMIT)]
    output_file_queue_limit: usize,

    /// Print every record to stdout
    #[arg(long, default_value_t = false)]
    output_stdout: bool,

    /// Drop every record (useful with --input-file-dry-run)
    #[arg(long, default_value_t = false)]
    output_null: bool,

    /// Stop after this long (0 = run until inputs end or Ctrl+C)
    #[arg(long, default_value = "0", value_parser = parse_duration)]
    exit_after: Duration,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(long, short = 'v', action = ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn settings(&self) -> Settings {
        Settings {
            input_file: self.input_file.clone(),
            input: FileInputConfig {
                loop_input: self.input_file_loop,
                read_depth: self.input_file_read_depth,
                max_wait: self.input_file_max_wait,
                dry_run: self.input_file_dry_run,
            },
            output_file: self.output_file.clone(),
            output: FileOutputConfig {
                size_limit: self.output_file_size_limit,
                max_size: self.output_file_max_size,
                flush_interval: self.output_file_flush_interval,
                append: self.output_file_append,
                queue_limit: self.output_file_queue_limit,
            },
            output_stdout: self.output_stdout,
            output_null: self.output_null,
            exit_after: self.exit_after,
        }
    }
}

fn main() -> Result<()> {
    // Load environment variables from .env if present
    let _ = dotenv();
    let args = Args::parse();
    logging::init(args.verbose);

    let settings = args.settings();
    settings.validate()?;
    info!(settings = %serde_json::to_string(&settings)?, "starting");

    let plugins = Plugins::build(&settings.plugin_configs()?).context("build plugins")?;
    if plugins.sources.is_empty() {
        bail!("no inputs configured, use --input-file");
    }
    if plugins.sinks.is_empty() {
        plugins.close_all();
        bail!("no outputs configured, use --output-file, --output-stdout or --output-null");
    }

    let mut emitter = Emitter::new();
    emitter.start(plugins).context("start emitter")?;

    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("install Ctrl+C handler")?;

    let deadline = if settings.exit_after.is_zero() { never() } else { after(settings.exit_after) };
    let poll = tick(Duration::from_millis(250));
    loop {
        select! {
            recv(stop_rx) -> _ => {
                info!("interrupted, shutting down");
                break;
            }
            recv(deadline) -> _ => {
                info!(after = ?settings.exit_after, "exit-after elapsed, shutting down");
                break;
            }
            recv(poll) -> _ => {
                if emitter.finished() {
                    info!("all inputs finished");
                    break;
                }
            }
        }
    }
    emitter.close();
    Ok(())
}
