// CLI entry point for the fabric coordination server.
//
// Builds a `FabricConfig` from the command line, installs the tracing
// subscriber and the SIGINT/SIGTERM stop flag, and runs one `Coordinator`
// with a `ScriptedProcessor` reading the command file (or stdin).
//
// Exit status: 0 when the run completes (with a warning if no `exit` command
// was seen), 1 when setup or the run fails, 2 for bad arguments.
//
// Usage:
//   fabric-server [OPTIONS]
//     --domain <local|networked>  Socket family (aliases AF_UNIX, AF_INET)
//     --cmd-file <PATH>           Command script (default: stdin)
//     --clients <N>               Number of client sessions (default: 4)
//     --base-port <PORT>          Port of session 0 (default: 50101)
//     ...see --help for the rest

use std::io::{self, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use fabric_server::config::{DEFAULT_BASE_PORT, DEFAULT_RESET_INTERVAL_NS, DEFAULT_SESSION_COUNT};
use fabric_server::{
    CommandProcessor, Coordinator, Diagnostic, Domain, FabricConfig, FabricError, FabricResult,
    Phase, QuorumPolicy, ScriptedProcessor, Topology,
};
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DomainArg {
    /// Unix-domain sockets on this host.
    #[value(alias = "AF_UNIX", alias = "unix")]
    Local,
    /// TCP sockets.
    #[value(alias = "AF_INET", alias = "inet")]
    Networked,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum QuorumArg {
    Abort,
    Exclude,
}

/// Fabric coordination server: reset barrier, time sync and Ethernet switch
/// for a set of simulation clients.
#[derive(Parser, Debug)]
#[command(name = "fabric-server")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Socket family for client endpoints.
    #[arg(long, value_enum, ignore_case = true, default_value = "local")]
    domain: DomainArg,

    /// Command script for the run phase. Reads stdin when absent.
    #[arg(long)]
    cmd_file: Option<PathBuf>,

    /// Number of client sessions.
    #[arg(long, default_value_t = DEFAULT_SESSION_COUNT)]
    clients: usize,

    /// Port of session 0; session i uses base + i.
    #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
    base_port: u16,

    /// Host address for the networked domain.
    #[arg(long, default_value = "127.0.0.1")]
    address: String,

    /// Directory for local-domain socket files.
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// How far a client may run ahead of the authorized time, ns.
    #[arg(long, default_value_t = 0)]
    lookahead: u64,

    /// Reset interval announced to clients, ns.
    #[arg(long, default_value_t = DEFAULT_RESET_INTERVAL_NS)]
    reset_interval: u64,

    /// What the reset barrier does when a client leaves before release.
    #[arg(long, value_enum, default_value = "abort")]
    quorum: QuorumArg,

    /// Forwarding table (TOML). Defaults to one station per port.
    #[arg(long)]
    topology: Option<PathBuf>,

    /// Do not invoke frame taps.
    #[arg(long)]
    no_monitor: bool,

    /// Write every monitored frame to this file as JSON lines.
    #[arg(long)]
    monitor_log: Option<PathBuf>,

    /// Give up if not every client has connected after this many seconds.
    #[arg(long)]
    accept_timeout_secs: Option<u64>,
}

impl Cli {
    fn into_config(self) -> FabricResult<FabricConfig> {
        let topology = self.topology.as_deref().map(Topology::load).transpose()?;
        let defaults = FabricConfig::default();
        Ok(FabricConfig {
            domain: match self.domain {
                DomainArg::Local => Domain::Local,
                DomainArg::Networked => Domain::Networked,
            },
            address: self.address,
            base_port: self.base_port,
            session_count: self.clients,
            socket_dir: self.socket_dir.unwrap_or(defaults.socket_dir),
            lookahead: self.lookahead,
            reset_interval: self.reset_interval,
            quorum: match self.quorum {
                QuorumArg::Abort => QuorumPolicy::Abort,
                QuorumArg::Exclude => QuorumPolicy::Exclude,
            },
            monitoring: !self.no_monitor,
            accept_timeout: self.accept_timeout_secs.map(Duration::from_secs),
            handshake_timeout: defaults.handshake_timeout,
            topology,
            command_file: self.cmd_file,
            monitor_log: self.monitor_log,
        })
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err((error, phase)) => {
            eprintln!("{}", Diagnostic::new(&error, phase));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), (FabricError, &'static str)> {
    let config = cli.into_config().map_err(|e| (e, Phase::Setup.name()))?;
    let mut processor = processor_for(&config).map_err(|e| (e, Phase::Setup.name()))?;
    let mut coordinator = Coordinator::new(config).map_err(|e| (e, Phase::Setup.name()))?;
    install_stop_signals(&coordinator).map_err(|e| (e, Phase::Setup.name()))?;

    let endpoints = coordinator.listen().map_err(|e| (e, Phase::Listen.name()))?;
    for (i, endpoint) in endpoints.iter().enumerate() {
        info!(session = i, %endpoint, "endpoint ready");
    }

    match coordinator.run(processor.as_mut()) {
        Ok(outcome) => {
            if !outcome.exit_requested {
                warn!("run ended without an exit command");
            }
            info!(
                epoch = %outcome.epoch,
                authorized = %outcome.authorized,
                "run complete"
            );
            Ok(())
        }
        Err(e) => {
            let phase = coordinator.failed_in().map_or(Phase::Run.name(), Phase::name);
            Err((e, phase))
        }
    }
}

fn processor_for(config: &FabricConfig) -> FabricResult<Box<dyn CommandProcessor>> {
    let processor: Box<dyn CommandProcessor> = match &config.command_file {
        Some(path) => Box::new(ScriptedProcessor::from_file(path)?),
        None => Box::new(ScriptedProcessor::new(BufReader::new(io::stdin()))),
    };
    Ok(processor)
}

/// First SIGINT/SIGTERM sets the coordinator's stop flag; a second one while
/// the flag is set terminates the process.
#[cfg(unix)]
fn install_stop_signals(coordinator: &Coordinator) -> FabricResult<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::flag;

    let stop = coordinator.stop_handle();
    for signal in [SIGINT, SIGTERM] {
        flag::register_conditional_shutdown(signal, 1, stop.clone())?;
        flag::register(signal, stop.clone())?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn install_stop_signals(_coordinator: &Coordinator) -> FabricResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_stock_setup() {
        let config = Cli::parse_from(["fabric-server"]).into_config().unwrap();
        assert_eq!(config.domain, Domain::Local);
        assert_eq!(config.session_count, 4);
        assert_eq!(config.base_port, 50101);
        assert_eq!(config.reset_interval, 100);
        assert!(config.monitoring);
        assert!(config.command_file.is_none());
    }

    #[test]
    fn socket_family_aliases_are_accepted() {
        let cli = Cli::parse_from(["fabric-server", "--domain", "AF_INET"]);
        assert!(matches!(cli.domain, DomainArg::Networked));
        let cli = Cli::parse_from(["fabric-server", "--domain", "af_unix"]);
        assert!(matches!(cli.domain, DomainArg::Local));
    }

    #[test]
    fn flags_fill_in_the_config() {
        let config = Cli::parse_from([
            "fabric-server",
            "--domain",
            "networked",
            "--clients",
            "2",
            "--base-port",
            "0",
            "--lookahead",
            "10",
            "--quorum",
            "exclude",
            "--no-monitor",
            "--accept-timeout-secs",
            "3",
            "--cmd-file",
            "script.txt",
        ])
        .into_config()
        .unwrap();
        assert_eq!(config.domain, Domain::Networked);
        assert_eq!(config.session_count, 2);
        assert_eq!(config.base_port, 0);
        assert_eq!(config.lookahead, 10);
        assert_eq!(config.quorum, QuorumPolicy::Exclude);
        assert!(!config.monitoring);
        assert_eq!(config.accept_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.command_file, Some(PathBuf::from("script.txt")));
    }

    #[test]
    fn unknown_domain_is_an_argument_error() {
        assert!(Cli::try_parse_from(["fabric-server", "--domain", "carrier-pigeon"]).is_err());
    }

    #[test]
    fn missing_topology_file_is_reported() {
        let err = Cli::parse_from(["fabric-server", "--topology", "/nonexistent/topo.toml"])
            .into_config()
            .unwrap_err();
        assert!(matches!(err, FabricError::Argument(_)));
    }
}
