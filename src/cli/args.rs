use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version)]
#[command(about = "Finds nearby robots over bluetooth and connects to one of them", long_about = None)]
pub struct Args {
    /// Log debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Scan for nearby robots and pick one to connect to
    Scan,

    /// Connect to a robot by address. Without an address, the last connected robot is used
    Connect {
        address: Option<String>,

        /// Display name for the robot
        #[arg(long)]
        name: Option<String>,

        /// Use a classic bluetooth (RFCOMM) link instead of Bluetooth LE
        #[arg(long)]
        classic: bool,
    },

    /// Print the preferences, changing the given ones first
    Prefs {
        /// Hide devices that do not speak the robot protocol
        #[arg(long)]
        filter_incompatible: Option<bool>,

        /// Scan for classic bluetooth devices
        #[arg(long)]
        scan_classic: Option<bool>,

        /// Scan for Bluetooth LE devices
        #[arg(long)]
        scan_le: Option<bool>,
    },
}
