use reelplay::audio::{AudioDevice, CpalDevice};
use reelplay::cli::Args;
use reelplay::core::clock::SystemClock;
use reelplay::core::pattern::{PatternOptions, PatternTimeline};
use reelplay::core::types::TimeAction;
use reelplay::core::workers::Workers;
use reelplay::core::{DecodeService, Timeline};
use reelplay::paths::{self, PathConfig};
use reelplay::{LoopMode, Playback, Player, PlayerContext, PlayerOptions, RationalTime, TimeRange};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn init_logging(args: &Args, path_config: &PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .clone()
            .unwrap_or_else(|| paths::data_file(paths::LOG_FILE, path_config));
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .filter_module("cpal", log::LevelFilter::Warn)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();
        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Respects RUST_LOG if set
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .filter_module("cpal", log::LevelFilter::Warn)
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn open_device(name: Option<&str>) -> Option<Box<dyn AudioDevice>> {
    let device = match name {
        Some(name) => CpalDevice::by_name(name),
        None => CpalDevice::default_output(),
    };
    match device {
        Ok(device) => {
            info!("Audio device: {}", device.name());
            Some(Box::new(device))
        }
        Err(e) => {
            warn!("No audio output: {}", e);
            None
        }
    }
}

fn seconds_to_frame(seconds: f64, rate: f64) -> RationalTime {
    RationalTime::from_seconds(seconds).rescaled_to(rate).floor()
}

fn configure(player: &Player, args: &Args) {
    player.set_loop(LoopMode::from(args.loop_mode));
    if let Some(speed) = args.speed {
        player.set_speed(speed);
    }
    if args.in_point.is_some() || args.out_point.is_some() {
        let range = player.time_range();
        let rate = range.rate();
        let start = args.in_point.map_or(range.start, |s| seconds_to_frame(s, rate));
        let end = args.out_point.map_or(range.end_inclusive(), |s| seconds_to_frame(s, rate));
        player.set_in_out_range(TimeRange::from_start_end_inclusive(start, end));
    }
    player.time_action(if args.reverse { TimeAction::End } else { TimeAction::Start });
}

fn print_status(label: &str, player: &Player) {
    let time = player.current_time();
    let info = player.cache_info();
    let shown = player
        .current_video()
        .map_or_else(|| "-".to_string(), |v| format!("{}", v.time.value));
    println!(
        "[{:>8}] t={:>8.3}s frame={:>6} shown={:>6} {:<7} video cache={:>5.1}% audio ranges={}",
        label,
        time.to_seconds(),
        time.value,
        shown,
        format!("{:?}", player.playback()),
        info.video_percentage,
        info.audio_ranges.len()
    );
}

fn main() -> Result<()> {
    let args = Args::parse();

    let path_config = PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = paths::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }
    init_logging(&args, &path_config)?;

    info!("reelplay {} starting", env!("CARGO_PKG_VERSION"));
    debug!("Command-line args: {:?}", args);

    let options_path = args
        .options
        .clone()
        .unwrap_or_else(|| paths::config_file(paths::OPTIONS_FILE, &path_config));
    info!("Options path: {}", options_path.display());
    let options = PlayerOptions::load(&options_path)?;
    if args.save_options {
        options.save(&options_path)?;
        println!("Options written to {}", options_path.display());
        return Ok(());
    }

    let run_for = Duration::try_from_secs_f64(args.duration).context("Invalid --duration")?;
    let print_every = Duration::from_millis(args.print_every_ms.max(1));

    let pattern = PatternOptions {
        duration_s: args.length,
        rate: args.rate,
        audio: if args.no_audio {
            None
        } else {
            PatternOptions::default().audio
        },
        ..Default::default()
    };
    let pattern = PatternTimeline::new(pattern);
    let decoder: Arc<dyn DecodeService> = Arc::new(pattern.decoder(Workers::default_size()));
    let timeline: Arc<dyn Timeline> = Arc::new(pattern);

    let audio_device = if args.no_audio {
        None
    } else {
        open_device(args.device.as_deref())
    };
    let player = Player::new(
        Arc::clone(&timeline),
        Arc::clone(&decoder),
        options.clone(),
        PlayerContext {
            clock: Arc::new(SystemClock),
            audio_device,
        },
    )?;
    configure(&player, &args);

    let follower = if args.follow {
        let follower = Player::new(timeline, decoder, options, PlayerContext::default())?;
        follower.set_external_time(Some(&player));
        Some(follower)
    } else {
        None
    };

    player.set_playback(if args.reverse {
        Playback::Reverse
    } else {
        Playback::Forward
    });

    let frame_period = Duration::from_secs_f64(1.0 / player.speed().max(1.0));
    let started = Instant::now();
    let mut next_print = started;
    while started.elapsed() < run_for {
        player.tick();
        if let Some(follower) = &follower {
            follower.tick();
        }
        if Instant::now() >= next_print {
            print_status("player", &player);
            if let Some(follower) = &follower {
                print_status("follower", follower);
            }
            next_print += print_every;
        }
        if player.playback() == Playback::Stop {
            info!("Playback reached the end of the range");
            break;
        }
        thread::sleep(frame_period);
    }

    player.set_playback(Playback::Stop);
    print_status("player", &player);
    info!("reelplay finished after {:.2}s", started.elapsed().as_secs_f64());
    Ok(())
}
