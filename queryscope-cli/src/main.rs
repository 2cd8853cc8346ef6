//! Queryscope daemon.
//!
//! Boots the monitoring agent on a database host: resolves the base
//! directory, layers configuration (defaults ← persisted file ← flags),
//! initializes logging, connects the command channel, restores persisted
//! services, and serves until `Stop` or SIGINT.
//!
//! Exit codes: 0 on orderly shutdown, 1 on unrecoverable init failure.

mod error;

use std::sync::Arc;

use clap::Parser;
use error::CliError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use queryscope::agent::{Agent, StopReason, STATUS_AGENT, STATUS_CMD_HANDLER};
use queryscope::channel::{CommandChannel, SocketTransport};
use queryscope::clock::Clock;
use queryscope::config::AgentConfig;
use queryscope::data::{self, sender, DataConfig, DataManager};
use queryscope::logging::init_logging;
use queryscope::mm::{self, LoadAvgMonitor, MmConfig, MmManager, Monitor};
use queryscope::mysql::{NullConnector, NullConnectorFactory};
use queryscope::paths::Paths;
use queryscope::proto::Cmd;
use queryscope::qan::{
    self, manager::STATUS_NEXT_INTERVAL, manager::STATUS_PARSER, FileIterFactory, FixedPath,
    QanConfig, QanManager, SlowLogWorkerFactory, TextParserFactory,
};
use queryscope::service::ServiceManager;
use queryscope::status::StatusRegistry;

/// Default agent base directory.
const DEFAULT_BASEDIR: &str = "/var/lib/queryscope";
/// Default slow-log path when the database does not report one.
const DEFAULT_SLOW_LOG: &str = "/var/log/mysql/slow.log";

#[derive(Debug, Parser)]
#[command(name = "queryscope", version = queryscope::VERSION)]
#[command(about = "Database host monitoring agent")]
struct Cli {
    /// Agent base directory (config, data spool, logs).
    #[arg(long, default_value = DEFAULT_BASEDIR)]
    basedir: String,

    /// Control-plane address overriding the persisted config.
    #[arg(long, default_value = "")]
    api_hostname: String,

    /// API key overriding the persisted config.
    #[arg(long, default_value = "")]
    api_key: String,

    /// Agent UUID overriding the persisted config.
    #[arg(long, default_value = "")]
    agent_uuid: String,

    /// Pid file path; empty disables it.
    #[arg(long, default_value = "")]
    pid_file: String,

    /// Log level: debug, info, warning, error.
    #[arg(long, default_value = "")]
    log_level: String,

    /// Slow log to analyze.
    #[arg(long, default_value = DEFAULT_SLOW_LOG)]
    slow_log: String,
}

impl Cli {
    fn as_config(&self) -> AgentConfig {
        AgentConfig {
            api_hostname: self.api_hostname.clone(),
            api_key: self.api_key.clone(),
            agent_uuid: self.agent_uuid.clone(),
            pid_file: self.pid_file.clone(),
            log_level: self.log_level.clone(),
            ..AgentConfig::default()
        }
    }
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(reason) => {
            info!(?reason, "exiting");
        }
        Err(e) => e.exit(),
    }
}

async fn run() -> Result<StopReason, CliError> {
    let cli = Cli::parse();

    let paths = Paths::new(&cli.basedir).map_err(|e| CliError::Init(e.to_string()))?;

    // Layered config: defaults, then the persisted agent config, then flags.
    let mut config = AgentConfig::defaults();
    let persisted = AgentConfig::load(paths.service_config_file("agent"))
        .map_err(|e| CliError::Config(e.to_string()))?;
    config.apply(&persisted);
    config.apply(&cli.as_config());

    let level = config
        .tracing_level()
        .map_err(|e| CliError::Config(e.to_string()))?;
    let _logging_guard = init_logging(&paths.log_dir(), level).map_err(CliError::Logging)?;
    info!(version = queryscope::VERSION, basedir = %paths.base().display(), "agent starting");

    if !config.pid_file.is_empty() {
        std::fs::write(&config.pid_file, format!("{}\n", std::process::id()))
            .map_err(|e| CliError::Init(format!("pid file {}: {}", config.pid_file, e)))?;
    }

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, shutting down");
            signal_shutdown.cancel();
        }
    });

    let status = Arc::new(StatusRegistry::new(&[
        STATUS_AGENT,
        STATUS_CMD_HANDLER,
        qan::SERVICE_NAME,
        STATUS_PARSER,
        STATUS_NEXT_INTERVAL,
        mm::SERVICE_NAME,
        data::SERVICE_NAME,
        sender::STATUS_KEY,
    ]));
    let clock = Arc::new(Clock::new());

    let transport = SocketTransport::new(config.api_hostname.clone());
    let (channel, handles) = CommandChannel::new(transport);
    tokio::spawn(channel.run(shutdown.clone()));

    let data_manager = Arc::new(DataManager::new(
        paths.clone(),
        Arc::clone(&clock),
        handles.data.clone(),
        Arc::clone(&status),
    ));
    let spool = data_manager.spool_handle();

    // The settings driver is the deployment's integration point; the agent
    // itself only carries the contract.
    let conn_factory = Arc::new(NullConnectorFactory::new(Arc::new(NullConnector::new())));
    let qan_manager = Arc::new(QanManager::new(
        paths.clone(),
        Arc::clone(&clock),
        conn_factory,
        Arc::new(FileIterFactory::new(Arc::new(FixedPath(
            cli.slow_log.clone().into(),
        )))),
        Arc::new(SlowLogWorkerFactory::new(
            Arc::new(TextParserFactory),
            Arc::clone(&status),
        )),
        spool.clone(),
        Arc::clone(&status),
    ));

    let monitors: Vec<Arc<dyn Monitor>> = vec![Arc::new(LoadAvgMonitor)];
    let mm_manager = Arc::new(MmManager::new(
        paths.clone(),
        Arc::clone(&clock),
        monitors,
        spool,
        Arc::clone(&status),
    ));

    let services: Vec<(String, Arc<dyn ServiceManager>)> = vec![
        (data::SERVICE_NAME.to_string(), data_manager),
        (qan::SERVICE_NAME.to_string(), qan_manager),
        (mm::SERVICE_NAME.to_string(), mm_manager),
    ];

    let agent = Agent::new(Arc::clone(&status), services, handles);
    agent.start_services(boot_commands(&paths)).await;

    let reason = agent.run(shutdown).await;

    if !config.pid_file.is_empty() {
        let _ = std::fs::remove_file(&config.pid_file);
    }
    Ok(reason)
}

/// Rebuilds `StartService` commands from configs persisted by earlier runs.
/// The data service goes first so the spool exists before producers start.
fn boot_commands(paths: &Paths) -> Vec<Cmd> {
    let mut cmds = Vec::new();

    if let Ok(Some(config)) = paths.read_service_config::<DataConfig>(data::SERVICE_NAME) {
        cmds.push(start_cmd(data::SERVICE_NAME, &config));
    }
    if let Ok(Some(config)) = paths.read_service_config::<QanConfig>(qan::SERVICE_NAME) {
        cmds.push(start_cmd(qan::SERVICE_NAME, &config));
    }
    if let Ok(Some(config)) = paths.read_service_config::<MmConfig>(mm::SERVICE_NAME) {
        cmds.push(start_cmd(mm::SERVICE_NAME, &config));
    }

    cmds
}

fn start_cmd<T: serde::Serialize>(name: &str, config: &T) -> Cmd {
    Cmd {
        cmd: "StartService".into(),
        data: Some(serde_json::json!({
            "Name": name,
            "Config": serde_json::to_value(config).unwrap_or(serde_json::Value::Null),
        })),
        ..Cmd::default()
    }
}
