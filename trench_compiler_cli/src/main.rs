//! # trench_compiler_cli
//!
//! Part of the trench_compiler crate family.
//!
//! This is the application to slice trench microscopy data from the command line.
//!
//! ## Use
//!
//! Make a template configuration with
//!
//! ```bash
//! trench_compiler_cli new -p config.yml
//! ```
//!
//! then edit it and run with
//!
//! ```bash
//! trench_compiler_cli -p config.yml
//! ```
//!
//! A detailed log of the run is written to `trench_compiler.log` in the working directory.
//!
//! Ctrl-C stops the run after the frames already being written. FOVs which were not
//! finished keep their monolithic output under the `.h5.partial` name. A second Ctrl-C
//! exits immediately.
use clap::{Arg, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use libtrench_compiler::config::Config;
use libtrench_compiler::process::process;
use libtrench_compiler::worker_status::{Phase, WorkerStatus};

fn make_template_config(path: &Path) {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config).unwrap();
    let mut file = File::create(path).expect("Could create template config file!");
    file.write_all(yaml_str.as_bytes())
        .expect("Failed to write yaml data to file!");
}

/// Route library logging (spdlog) to a file
fn init_file_log() {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from("./trench_compiler.log"))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()
            .unwrap(),
    );
    let logger = Arc::new(
        spdlog::Logger::builder()
            .flush_level_filter(spdlog::LevelFilter::All)
            .sink(file_sink)
            .build()
            .unwrap(),
    );
    spdlog::set_default_logger(logger);
}

fn update_bar(pb_manager: &MultiProgress, bars: &mut BTreeMap<usize, ProgressBar>, status: WorkerStatus) {
    let pb = bars.entry(status.worker_id).or_insert_with(|| {
        let pb = pb_manager.add(ProgressBar::new(100));
        pb.set_style(
            ProgressStyle::with_template("{prefix} [{bar:40}] {pos}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb.set_prefix(format!("Worker {}", status.worker_id));
        pb
    });
    let phase = match status.phase {
        Phase::Detecting => "detecting",
        Phase::Writing => "writing",
    };
    pb.set_message(format!("{} FOV {}", phase, status.fov));
    pb.set_position((status.progress * 100.0) as u64);
}

fn main() {
    // Create a cli
    let matches = Command::new("trench_compiler_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .global(true)
                .help("Path to the file"),
        )
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .expect("Could not create logging/progress!");

    init_file_log();

    // Parse the cli
    let config_path = PathBuf::from(matches.get_one::<String>("path").expect("We require args"));

    if let Some(("new", _)) = matches.subcommand() {
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );

        make_template_config(&config_path);
        log::info!("Done.");
        return;
    }

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    log::info!("Config successfully loaded.");
    log::info!("Experiment Name: {}", config.experiment_name);
    log::info!("Image Path: {}", config.image_path.to_string_lossy());
    log::info!("Analysis Path: {}", config.analysis_path.to_string_lossy());
    log::info!("Output Mode: {:?}", config.output_mode);
    log::info!("Number of Workers: {}", config.get_n_workers());

    // Spawn the task!
    let (tx, rx) = mpsc::channel::<WorkerStatus>();
    let abort = Arc::new(AtomicBool::new(false));
    let handler_abort = abort.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if handler_abort.swap(true, Ordering::Relaxed) {
            std::process::exit(130);
        }
        log::warn!("Stopping after the frames in flight, press Ctrl-C again to exit now.");
    }) {
        log::warn!("Could not install the Ctrl-C handler: {e}");
    }
    let process_abort = abort.clone();
    let handle = std::thread::spawn(move || process(config, tx, process_abort));

    let mut bars: BTreeMap<usize, ProgressBar> = BTreeMap::new();
    loop {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(status) => update_bar(&pb_manager, &mut bars, status),
            Err(RecvTimeoutError::Timeout) => (),
            // The processor is done once every sender is gone
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    match handle.join() {
        Ok(result) => match result {
            Ok(summary) => {
                log::info!(
                    "Analyzed {} frames ({} unreadable), wrote {} frames with {} lane failures.",
                    summary.frames_analyzed,
                    summary.frames_failed,
                    summary.frames_written(),
                    summary.lane_failures()
                );
                if summary.frames_failed > 0 || summary.lane_failures() > 0 {
                    log::warn!("Some frames or lanes failed, check trench_compiler.log for details.");
                }
            }
            Err(e) => log::error!("Processing failed with error: {e}"),
        },
        Err(_) => log::error!("Failed to join processing task!"),
    }

    if abort.load(Ordering::Relaxed) {
        log::warn!("The run was stopped early, rerun to complete it.");
    }

    for pb in bars.values() {
        pb.finish();
    }

    log::info!("Done.");
}
