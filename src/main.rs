use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{ArgAction, Parser, Subcommand};
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};

use burrow::{config, ui};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Verbosity (-v, -vv, -vvv, etc.)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Prepend timestamps to all trace messages (from --verbose).
    /// Useful for benchmarking.
    #[arg(short, long)]
    timestamps: bool,

    #[arg(short, long)]
    repository: Utf8PathBuf,

    #[command(subcommand)]
    subcommand: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Init,
    Gc(ui::gc::Args),
    Ls(ui::ls::Args),
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.verbose, args.timestamps);
    let config = config::load()?;

    match args.subcommand {
        Command::Init => ui::init::run(&args.repository),
        Command::Gc(g) => ui::gc::run(&config, &args.repository, g),
        Command::Ls(l) => ui::ls::run(&args.repository, l),
    }
}

/// Set up simplelog to spit messages to stderr.
fn init_logger(verbosity: u8, timestamps: bool) {
    let mut builder = ConfigBuilder::new();
    // Shut a bunch of stuff off - we're just spitting to stderr.
    builder.set_location_level(LevelFilter::Trace);
    builder.set_target_level(LevelFilter::Off);
    builder.set_thread_level(LevelFilter::Off);
    if timestamps {
        builder.set_time_format_rfc3339();
        builder.set_time_level(LevelFilter::Error);
    } else {
        builder.set_time_level(LevelFilter::Off);
    }

    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    TermLogger::init(
        level,
        builder.build(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .expect("Couldn't init logger");
}
