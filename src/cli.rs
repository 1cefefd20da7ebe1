use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::core::types::LoopMode;

const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"),
    "\n",
    "Audio:  cpal 0.15, rubato 0.15\n",
    "Target: ",
    std::env::consts::ARCH,
    "-",
    std::env::consts::OS
);

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopArg {
    Loop,
    Once,
    PingPong,
}

impl From<LoopArg> for LoopMode {
    fn from(arg: LoopArg) -> Self {
        match arg {
            LoopArg::Loop => LoopMode::Loop,
            LoopArg::Once => LoopMode::Once,
            LoopArg::PingPong => LoopMode::PingPong,
        }
    }
}

/// Plays a generated test pattern through the playback engine
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Timeline duration in seconds
    #[arg(long = "length", value_name = "SECONDS", default_value_t = 10.0)]
    pub length: f64,

    /// Timeline frame rate
    #[arg(short = 'r', long = "rate", value_name = "FPS", default_value_t = 24.0)]
    pub rate: f64,

    /// How long to play before exiting, in seconds
    #[arg(short = 'd', long = "duration", value_name = "SECONDS", default_value_t = 5.0)]
    pub duration: f64,

    /// Loop mode at the in/out boundary
    #[arg(short = 'o', long = "loop", value_enum, default_value = "loop")]
    pub loop_mode: LoopArg,

    /// In point in seconds
    #[arg(long = "in", value_name = "SECONDS")]
    pub in_point: Option<f64>,

    /// Out point in seconds (inclusive)
    #[arg(long = "out", value_name = "SECONDS")]
    pub out_point: Option<f64>,

    /// Playback speed in frames per second (default: timeline rate)
    #[arg(short = 's', long = "speed", value_name = "FPS")]
    pub speed: Option<f64>,

    /// Play backwards
    #[arg(long = "reverse")]
    pub reverse: bool,

    /// Disable audio output
    #[arg(long = "no-audio")]
    pub no_audio: bool,

    /// Output device name (default: system default)
    #[arg(long = "device", value_name = "NAME")]
    pub device: Option<String>,

    /// Run a second player following the first one
    #[arg(long = "follow")]
    pub follow: bool,

    /// Status print interval in milliseconds
    #[arg(long = "print-every", value_name = "MS", default_value_t = 500)]
    pub print_every_ms: u64,

    /// Player options JSON file (default: reelplay.json in the config dir)
    #[arg(long = "options", value_name = "FILE")]
    pub options: Option<PathBuf>,

    /// Write the effective options to the options file and exit
    #[arg(long = "save-options")]
    pub save_options: bool,

    /// Enable logging to file (default: reelplay.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}
