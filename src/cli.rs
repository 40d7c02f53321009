use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// The command line interface for uart monitor.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Where sessions, the control socket and the status file live
    #[arg(long, global = true)]
    pub log_root: Option<PathBuf>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon in the foreground.
    Monitor(MonitorArgs),

    /// List connected USB-serial devices.
    Identify {
        /// Also show the label each port's log would get
        #[arg(short, long)]
        verbose: bool,
    },

    /// Ask the daemon what it is monitoring.
    Status,

    /// Release a port, e.g. for flashing.
    Yield {
        /// Device path, e.g. `/dev/ttyUSB0`
        device: PathBuf,
    },

    /// Resume monitoring a yielded port.
    Reclaim {
        /// Device path, e.g. `/dev/ttyUSB0`
        device: PathBuf,
    },

    /// Follow a port's log in the latest session.
    Tail {
        /// Label or device, e.g. `VMK180_UART0` or `/dev/ttyUSB0`
        name: String,
    },

    /// Show examples of inputs.
    #[command(subcommand)]
    Examples(Examples),
}

/// Overrides of the configuration file for `monitor`.
#[derive(Args)]
pub struct MonitorArgs {
    /// Line rate for every port
    #[arg(short, long)]
    pub baud: Option<u32>,

    /// Comma separated devices to monitor, e.g. `ttyUSB0,/dev/ttyACM1`
    #[arg(long)]
    pub only: Option<String>,

    /// Share each port with other tools through a pseudo-terminal
    #[arg(long)]
    pub proxy: bool,

    /// Notify systemd when ready and when stopping
    #[arg(long)]
    pub systemd: bool,
}

/// Example inputs.
#[derive(Subcommand)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,
}
