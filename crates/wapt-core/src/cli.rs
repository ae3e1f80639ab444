use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::mac::MacAddr;

#[derive(Parser, Debug)]
#[command(
    name = "wapt",
    author,
    version,
    about = "Provision a wireless interface as an access point and tear it down again"
)]
pub struct Cli {
    /// Override the install root (defaults to $WAPT_ROOT, /opt/wapt, or the current directory)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Output format for command responses
    #[arg(
        long = "output",
        value_enum,
        default_value_t = OutputFormat::Json,
        global = true
    )]
    pub output_format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start an access point from a saved profile
    Start(StartArgs),
    /// Stop the running access point and restore the interface
    Stop(StopArgs),
    /// Show the current session record
    Status,
    /// List saved profiles
    Profiles,
    /// Show DHCP leases handed out by the access point
    Leases,
    /// Show stations associated with the access point
    Stations,
    /// Direct interface control
    #[command(subcommand)]
    Iface(IfaceCommand),
    /// Show or change the persisted logging settings
    Logging(LoggingArgs),
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Profile name (file stem under <root>/profiles)
    pub profile: String,

    /// Route clients out through the egress interface
    #[arg(long)]
    pub nat: bool,

    /// Advertise this BSSID instead of the interface address
    #[arg(long, conflicts_with = "bssid_index")]
    pub bssid: Option<MacAddr>,

    /// Advertise the locally administered BSSID 02:00:00:00:00:NN
    #[arg(long)]
    pub bssid_index: Option<u8>,
}

impl StartArgs {
    pub fn resolved_bssid(&self) -> Option<MacAddr> {
        self.bssid
            .or_else(|| self.bssid_index.map(MacAddr::locally_administered))
    }
}

#[derive(Args, Debug)]
pub struct StopArgs {
    /// Reload the driver instead of a soft reset
    #[arg(long)]
    pub hard_reset: bool,
}

#[derive(Args, Debug, Default)]
pub struct LoggingArgs {
    /// Filter directive, e.g. `debug` or `info,wapt::iface=trace`
    #[arg(long)]
    pub level: Option<String>,

    #[arg(long, conflicts_with = "disable")]
    pub enable: bool,

    #[arg(long)]
    pub disable: bool,

    /// Days of rotated logs to keep
    #[arg(long)]
    pub keep_days: Option<u64>,
}

impl LoggingArgs {
    pub fn is_query(&self) -> bool {
        self.level.is_none() && !self.enable && !self.disable && self.keep_days.is_none()
    }
}

#[derive(Subcommand, Debug)]
pub enum IfaceCommand {
    /// Admin state, mode and address
    Status,
    Up,
    Down,
    /// Switch operational mode (managed or monitor)
    Mode(ModeArgs),
    /// Soft reset, or reload the driver with --hard
    Reset(ResetArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModeChoice {
    Managed,
    Monitor,
}

#[derive(Args, Debug)]
pub struct ModeArgs {
    #[arg(value_enum)]
    pub mode: ModeChoice,
}

#[derive(Args, Debug)]
pub struct ResetArgs {
    #[arg(long)]
    pub hard: bool,
}
