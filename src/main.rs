mod backlight_controller;
mod camera_controller;
mod cancellable_task;
mod capture_controller;
mod common;
mod display;
mod encoder_controller;
mod errors;
mod mailbox;
mod ui_controller;
mod user_config;

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use rppal::gpio::Gpio;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    backlight_controller::BacklightFade,
    camera_controller::V4l2Camera,
    capture_controller::CaptureScheduler,
    display::{Hd44780Display, SharedDisplay},
    encoder_controller::start_encoder,
    errors::AppError,
    mailbox::Mailbox,
    ui_controller::{run_event_loop, UiStateMachine},
    user_config::UserConfig,
};

#[derive(Parser)]
#[command(name = "timelapse-pi")]
#[command(about = "Rotary encoder driven timelapse controller for a V4L2 camera")]
#[command(version)]
struct Cli {
    /// Directory containing timelapse.json
    #[arg(short, long, default_value = "./config")]
    config_dir: PathBuf,
}

fn main() -> ExitCode {
    // Set RUST_LOG to control the log level, e.g. RUST_LOG=timelapse_pi=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), AppError> {
    let config = UserConfig::read(&cli.config_dir)?;
    let mailbox = Arc::new(Mailbox::new());

    let signal_mailbox = mailbox.clone();
    ctrlc::set_handler(move || {
        if signal_mailbox.is_closed() {
            // Second Ctrl+C while teardown is stuck.
            std::process::exit(130);
        }
        info!("Interrupted, shutting down...");
        signal_mailbox.close();
    })?;

    let gpio = Gpio::new()?;
    // Interrupts stay registered for as long as this lives.
    let _encoder = start_encoder(&gpio, &config.encoder, mailbox.clone())?;
    let display = SharedDisplay::new(Hd44780Display::new(&gpio, &config.lcd)?);

    let camera = Arc::new(V4l2Camera::new(config.camera.clone()));
    let scheduler = CaptureScheduler::new(
        camera,
        display.clone(),
        mailbox.clone(),
        config.refresh_tick,
    );
    let backlight = BacklightFade::new(display.clone(), config.backlight);
    let mut ui = UiStateMachine::new(config.capture, scheduler, display.clone());

    info!("Starting event loop");
    run_event_loop(&mailbox, &mut ui, &backlight); // returns once the mailbox is closed

    // Camera first, so it is released even if the display hangs.
    if let Some(report) = ui.shutdown() {
        warn!(
            run_id = report.run_id,
            captured = report.captured,
            "Capture run ended by shutdown"
        );
    }
    info!(config = ?ui.config(), "Shut down");
    backlight.stop();
    display.clear();
    display.set_backlight(0);
    Ok(())
}
