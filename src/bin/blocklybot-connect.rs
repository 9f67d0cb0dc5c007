use clap::Parser;
use log::info;
use blocklybot_connect::{init_logging, run};
use blocklybot_connect::cli::args::Args;
use blocklybot_connect::error::{AppRunError, ConfigError};

fn main() -> Result<(), AppRunError> {
    let args = Args::parse();
    init_logging(if args.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info });
    info!(concat!("BlocklyBot Connect ", env!("CARGO_PKG_VERSION")));

    match run(args) {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            eprintln!("This application has already been started");
            Ok(())
        },
        Err(AppRunError::NothingSelected) => Ok(()),
        Err(err) => {
            eprintln!("{}", err);
            Err(err)
        }
        Ok(_) => Ok(())
    }
}
