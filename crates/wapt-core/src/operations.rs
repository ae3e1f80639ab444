use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info};
use wapt_logging::targets::T_IFACE;

use crate::cli::{Commands, IfaceCommand, LoggingArgs, ModeChoice, StartArgs, StopArgs};
use crate::config::WaptConfig;
use crate::inspect;
use crate::interface::{InterfaceMachine, OperationalMode};
use crate::manager::{with_suspended, Purpose};
use crate::profile;
use crate::session::{SessionOrchestrator, SessionRequest, StopOptions};
use crate::system::Host;

/// Human message plus structured payload.
pub type HandlerResult = (String, Value);

/// Everything a command handler needs: the install root, the loaded
/// configuration and the host it acts on.
pub struct Context {
    root: PathBuf,
    orchestrator: SessionOrchestrator,
}

impl Context {
    pub fn new(root: impl Into<PathBuf>, cfg: WaptConfig, host: Host) -> Self {
        Self {
            root: root.into(),
            orchestrator: SessionOrchestrator::new(cfg, host),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn orchestrator(&self) -> &SessionOrchestrator {
        &self.orchestrator
    }

    fn config(&self) -> &WaptConfig {
        self.orchestrator.config()
    }
}

pub fn dispatch_command(ctx: &Context, command: Commands) -> Result<HandlerResult> {
    match command {
        Commands::Start(args) => handle_start(ctx, args),
        Commands::Stop(args) => handle_stop(ctx, args),
        Commands::Status => handle_status(ctx),
        Commands::Profiles => handle_profiles(ctx),
        Commands::Leases => handle_leases(ctx),
        Commands::Stations => handle_stations(ctx),
        Commands::Iface(sub) => handle_iface(ctx, sub),
        Commands::Logging(args) => handle_logging(ctx, args),
    }
}

fn handle_start(ctx: &Context, args: StartArgs) -> Result<HandlerResult> {
    let request = SessionRequest {
        bssid: args.resolved_bssid(),
        profile: args.profile,
        nat: args.nat,
    };
    let outcome = ctx.orchestrator.start(&request)?;
    let message = format!(
        "Access point '{}' running on channel {} (BSSID {})",
        outcome.record.ssid, outcome.record.channel, outcome.record.bssid
    );
    Ok((message, serde_json::to_value(&outcome)?))
}

fn handle_stop(ctx: &Context, args: StopArgs) -> Result<HandlerResult> {
    let report = ctx.orchestrator.stop(StopOptions {
        hard_reset: args.hard_reset,
    })?;
    let message = if report.warnings.is_empty() {
        "Access point stopped".to_string()
    } else {
        format!(
            "Access point stopped with {} warning(s)",
            report.warnings.len()
        )
    };
    Ok((message, serde_json::to_value(&report)?))
}

fn handle_status(ctx: &Context) -> Result<HandlerResult> {
    let now = Utc::now().timestamp();
    let tracker = ctx.orchestrator.status();
    let summary = tracker.summary(now);
    let record = tracker.read().ok().flatten();
    let interface = ctx.orchestrator.interface(None).status().ok();
    Ok((
        summary.clone(),
        json!({
            "summary": summary,
            "active": tracker.exists(),
            "record": record,
            "interface": interface,
        }),
    ))
}

fn handle_profiles(ctx: &Context) -> Result<HandlerResult> {
    let dir = &ctx.config().profiles_dir;
    let profiles = profile::list_profiles(dir)
        .with_context(|| format!("listing profiles in {}", dir.display()))?;
    Ok((
        format!("{} profile(s)", profiles.len()),
        json!({ "profiles": profiles }),
    ))
}

fn handle_leases(ctx: &Context) -> Result<HandlerResult> {
    let path = ctx.config().leases_path();
    let leases = inspect::read_leases(&path)?;
    Ok((
        format!("{} lease(s)", leases.len()),
        json!({ "leases": leases }),
    ))
}

fn handle_stations(ctx: &Context) -> Result<HandlerResult> {
    let interface = &ctx.config().interface;
    let dump = ctx.orchestrator.host().link.station_dump(interface)?;
    let stations = inspect::parse_station_dump(&dump);
    Ok((
        format!("{} station(s) on {interface}", stations.len()),
        json!({ "interface": interface, "stations": stations }),
    ))
}

fn handle_logging(ctx: &Context, args: LoggingArgs) -> Result<HandlerResult> {
    let mut cfg = wapt_logging::read_config(&ctx.root);
    if args.is_query() {
        return Ok(("Logging settings".to_string(), serde_json::to_value(&cfg)?));
    }

    if let Some(level) = args.level {
        if level.trim().is_empty() {
            bail!("log level must not be empty");
        }
        cfg.level = level;
    }
    if args.enable {
        cfg.enabled = true;
    }
    if args.disable {
        cfg.enabled = false;
    }
    if let Some(days) = args.keep_days {
        cfg.keep_days = days;
    }
    wapt_logging::write_config_atomic(&ctx.root, &cfg)?;

    // Only a live subscriber can be reloaded; the file is what persists.
    if let Err(err) = wapt_logging::apply(&cfg) {
        debug!("logging filter not reloaded: {err:#}");
    }
    Ok(("Logging settings updated".to_string(), serde_json::to_value(&cfg)?))
}

fn handle_iface(ctx: &Context, command: IfaceCommand) -> Result<HandlerResult> {
    let machine = ctx.orchestrator.interface(None);
    if let IfaceCommand::Status = command {
        let status = machine.status()?;
        let message = format!("{}: {} {}", status.name, status.admin, status.mode);
        return Ok((message, serde_json::to_value(&status)?));
    }

    // Direct control would fight a running access point.
    if ctx.orchestrator.status().exists() {
        bail!(
            "An access point is running on '{}'; stop it before changing the interface",
            machine.name()
        );
    }

    let action = match &command {
        IfaceCommand::Up => "up",
        IfaceCommand::Down => "down",
        IfaceCommand::Mode(args) => match args.mode {
            ModeChoice::Managed => "managed",
            ModeChoice::Monitor => "monitor",
        },
        IfaceCommand::Reset(args) if args.hard => "hard-reset",
        IfaceCommand::Reset(_) | IfaceCommand::Status => "soft-reset",
    };

    let applied = match command {
        // Resets own the network manager themselves.
        IfaceCommand::Reset(args) if args.hard => machine.reset_hard(),
        IfaceCommand::Reset(_) => machine.reset_soft(),
        other => {
            let coordinator = ctx.orchestrator.coordinator();
            with_suspended(&coordinator, Purpose::Maintenance, || apply(&machine, other))
                .map(|((), _)| ())
        }
    };
    applied.with_context(|| format!("interface {action} on '{}'", machine.name()))?;
    info!(target: T_IFACE, interface = machine.name(), action, "direct interface command done");

    let status = machine.status()?;
    let message = format!("{}: {} {}", status.name, status.admin, status.mode);
    Ok((message, serde_json::to_value(&status)?))
}

fn apply(machine: &InterfaceMachine, command: IfaceCommand) -> crate::Result<()> {
    match command {
        IfaceCommand::Up => machine.bring_up(),
        IfaceCommand::Down => machine.bring_down(),
        IfaceCommand::Mode(args) => machine.set_mode(match args.mode {
            ModeChoice::Managed => OperationalMode::Managed,
            ModeChoice::Monitor => OperationalMode::Monitor,
        }),
        IfaceCommand::Status | IfaceCommand::Reset(_) => Ok(()),
    }
}
