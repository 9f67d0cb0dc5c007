use std::env;
use crate::cli::application::run_application;
use crate::cli::args::Args;
use crate::error::AppRunError;

pub mod cli;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod selector;

pub fn init_logging(level: log::LevelFilter) {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        // btleplug and bluez are very chatty at debug level
        .level_for("btleplug", log::LevelFilter::Info)
        .level_for("bluer", log::LevelFilter::Info)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).expect("Failed to open LOG_FILE")
        );
    }

    dispatch.apply().expect("Failed to initialize logger");
}

pub fn run(args: Args) -> Result<(), AppRunError> {
    run_application(args)?;
    Ok(())
}
