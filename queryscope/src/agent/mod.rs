//! Agent supervisor.
//!
//! The agent owns the command-channel handles and the service-manager map,
//! and runs two cooperating loops:
//!
//! - the **main loop** receives commands in arrival order. `Status` is
//!   answered immediately and `Stop` begins shutdown; everything else is
//!   queued for the handler.
//! - the **command handler** processes queued commands one at a time. A
//!   service `Start`/`Stop` may take arbitrarily long; commands arriving
//!   meanwhile stay in the queue and are visible in the status reply's
//!   `AgentCmdQueue` until their turn completes.
//!
//! Channel disconnects are observations, not failures: the channel
//! reconnects on its own and the agent keeps serving.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::ChannelHandles;
use crate::proto::{Cmd, Reply, StatusReport};
use crate::service::{ServiceError, ServiceManager};
use crate::status::StatusRegistry;
use crate::task::GuardedTask;

/// Status key of the agent itself.
pub const STATUS_AGENT: &str = "agent";
/// Status key of the command handler.
pub const STATUS_CMD_HANDLER: &str = "agent-cmd-handler";

/// Bounded wait for each service during agent teardown.
const SERVICE_STOP_WAIT: Duration = Duration::from_secs(5);

type Services = Arc<Vec<(String, Arc<dyn ServiceManager>)>>;

/// Why the agent's run loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Orderly `Stop` command from the control plane.
    Commanded,
    /// The shutdown token fired (signal handling, tests).
    Cancelled,
    /// The command stream closed underneath us.
    ChannelClosed,
}

/// The service supervisor.
pub struct Agent {
    status: Arc<StatusRegistry>,
    services: Services,
    commands: mpsc::Receiver<Cmd>,
    replies: mpsc::Sender<Reply>,
    errors: mpsc::Receiver<crate::channel::ChannelError>,
    queue: Arc<StdMutex<VecDeque<Cmd>>>,
}

impl Agent {
    /// Builds the agent over its channel handles. Service order fixes the
    /// order services appear in status handling.
    pub fn new(
        status: Arc<StatusRegistry>,
        services: Vec<(String, Arc<dyn ServiceManager>)>,
        handles: ChannelHandles,
    ) -> Self {
        Self {
            status,
            services: Arc::new(services),
            commands: handles.commands,
            replies: handles.replies,
            errors: handles.errors,
            queue: Arc::new(StdMutex::new(VecDeque::new())),
        }
    }

    /// Runs `StartService` commands locally, before the channel serves.
    ///
    /// Used at boot to bring persisted services up; no replies are sent
    /// because the control plane did not request these.
    pub async fn start_services(&self, cmds: Vec<Cmd>) {
        for cmd in cmds {
            if cmd.cmd != "StartService" {
                warn!(verb = %cmd.cmd, "ignoring non-StartService boot command");
                continue;
            }
            let reply = handle_service_cmd(&self.services, &cmd).await;
            if reply.error.is_empty() {
                info!(%cmd, "boot-started service");
            } else {
                warn!(%cmd, error = %reply.error, "boot start failed");
            }
        }
    }

    /// Serves commands until `Stop`, cancellation, or channel teardown.
    pub async fn run(mut self, shutdown: CancellationToken) -> StopReason {
        self.status.update(STATUS_AGENT, "Ready");
        self.status.update(STATUS_CMD_HANDLER, "Ready");

        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let handler = CmdHandler {
            work_rx,
            services: Arc::clone(&self.services),
            replies: self.replies.clone(),
            status: Arc::clone(&self.status),
            queue: Arc::clone(&self.queue),
        };
        let mut handler_task = GuardedTask::spawn("agent-cmd-handler", move |token| {
            handler.run(token)
        });

        let mut errors_open = true;
        let reason = loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break StopReason::Cancelled,

                err = self.errors.recv(), if errors_open => {
                    match err {
                        // The channel reconnects on its own; just observe.
                        Some(err) => warn!(error = %err, "command channel disconnected"),
                        None => errors_open = false,
                    }
                }

                cmd = self.commands.recv() => match cmd {
                    None => break StopReason::ChannelClosed,
                    Some(cmd) => match cmd.cmd.as_str() {
                        "Status" => {
                            debug!(id = cmd.id, "answering status out-of-band");
                            let reply = self.status_reply(&cmd);
                            let _ = self.replies.send(reply).await;
                        }
                        "Stop" => {
                            info!(id = cmd.id, "stop commanded");
                            let _ = self.replies.send(cmd.reply_ok(Value::Null)).await;
                            break StopReason::Commanded;
                        }
                        _ => {
                            if let Ok(mut queue) = self.queue.lock() {
                                queue.push_back(cmd.clone());
                            }
                            if work_tx.send(cmd).is_err() {
                                break StopReason::ChannelClosed;
                            }
                        }
                    }
                },
            }
        };

        handler_task.stop_and_wait().await;
        self.stop_all_services().await;
        self.status.update(STATUS_AGENT, "Stopped");
        info!(?reason, "agent stopped");
        reason
    }

    fn status_reply(&self, cmd: &Cmd) -> Reply {
        let report = self.status_report();
        match serde_json::to_value(&report) {
            Ok(value) => cmd.reply_ok(value),
            Err(e) => cmd.reply_err(e),
        }
    }

    fn status_report(&self) -> StatusReport {
        let mut report = StatusReport {
            agent: self.status.get(STATUS_AGENT),
            agent_cmd_handler: self.status.get(STATUS_CMD_HANDLER),
            agent_cmd_queue: self
                .queue
                .lock()
                .map(|q| q.iter().map(|c| c.to_string()).collect())
                .unwrap_or_default(),
            qan_log_parser: self.status.get(crate::qan::manager::STATUS_PARSER),
            ..StatusReport::default()
        };

        for (name, manager) in self.services.iter() {
            let value = manager.status();
            match name.as_str() {
                "qan" => report.qan = value,
                "mm" => report.mm = value,
                "data" => report.data = value,
                other => {
                    report.extra.insert(other.to_string(), value);
                }
            }
        }

        // Transient per-worker entries ride along.
        for (key, value) in self.status.snapshot() {
            if key.starts_with("qan-worker-") {
                report.extra.insert(key, value);
            }
        }
        report
    }

    async fn stop_all_services(&self) {
        let stop_cmd = Cmd {
            cmd: "StopService".into(),
            ..Cmd::default()
        };
        for (name, manager) in self.services.iter() {
            if !manager.is_running() {
                continue;
            }
            match tokio::time::timeout(SERVICE_STOP_WAIT, manager.stop(&stop_cmd)).await {
                Ok(Ok(())) => debug!(service = %name, "service stopped"),
                Ok(Err(e)) => warn!(service = %name, error = %e, "service stop failed"),
                Err(_) => warn!(service = %name, "service stop timed out, abandoning"),
            }
        }
    }
}

struct CmdHandler {
    work_rx: mpsc::UnboundedReceiver<Cmd>,
    services: Services,
    replies: mpsc::Sender<Reply>,
    status: Arc<StatusRegistry>,
    queue: Arc<StdMutex<VecDeque<Cmd>>>,
}

impl CmdHandler {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => return,

                cmd = self.work_rx.recv() => {
                    let Some(cmd) = cmd else { return };
                    self.status.update_cmd(STATUS_CMD_HANDLER, &cmd.cmd, cmd.id);

                    let reply = handle_service_cmd(&self.services, &cmd).await;

                    // The command leaves the visible queue only once done,
                    // and before its reply goes out.
                    if let Ok(mut queue) = self.queue.lock() {
                        if queue.front().map(|c| c.id) == Some(cmd.id) {
                            queue.pop_front();
                        } else {
                            queue.retain(|c| c.id != cmd.id);
                        }
                    }
                    self.status.update(STATUS_CMD_HANDLER, "Ready");
                    let _ = self.replies.send(reply).await;
                }
            }
        }
    }
}

/// Dispatches one non-status command to its service manager.
async fn handle_service_cmd(
    services: &[(String, Arc<dyn ServiceManager>)],
    cmd: &Cmd,
) -> Reply {
    let find = |name: &str| {
        services
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| Arc::clone(m))
    };

    match cmd.cmd.as_str() {
        "StartService" => {
            let sd = match cmd.service_data() {
                Ok(sd) => sd,
                Err(e) => return cmd.reply_err(ServiceError::Decode(e.to_string())),
            };
            let Some(manager) = find(&sd.name) else {
                return cmd.reply_err(ServiceError::UnknownService(sd.name));
            };
            if manager.is_running() {
                return cmd.reply_err(ServiceError::AlreadyRunning(sd.name));
            }
            match manager.start(cmd, sd.config).await {
                Ok(()) => cmd.reply_ok(Value::Null),
                Err(e) => cmd.reply_err(e),
            }
        }
        "StopService" => {
            let sd = match cmd.service_data() {
                Ok(sd) => sd,
                Err(e) => return cmd.reply_err(ServiceError::Decode(e.to_string())),
            };
            let Some(manager) = find(&sd.name) else {
                return cmd.reply_err(ServiceError::UnknownService(sd.name));
            };
            match manager.stop(cmd).await {
                Ok(()) => cmd.reply_ok(Value::Null),
                Err(e) => cmd.reply_err(e),
            }
        }
        "GetConfig" => match find(&cmd.service) {
            Some(manager) => manager.handle(cmd).await,
            None => cmd.reply_err(ServiceError::UnknownService(cmd.service.clone())),
        },
        other => cmd.reply_err(ServiceError::UnknownCommand(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubManager {
        name: String,
        running: AtomicBool,
    }

    impl StubManager {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                running: AtomicBool::new(false),
            })
        }
    }

    impl ServiceManager for StubManager {
        fn name(&self) -> &str {
            &self.name
        }

        fn start<'a>(
            &'a self,
            _cmd: &'a Cmd,
            _config: Value,
        ) -> BoxFuture<'a, Result<(), ServiceError>> {
            Box::pin(async move {
                self.running.store(true, Ordering::SeqCst);
                Ok(())
            })
        }

        fn stop<'a>(&'a self, _cmd: &'a Cmd) -> BoxFuture<'a, Result<(), ServiceError>> {
            Box::pin(async move {
                self.running.store(false, Ordering::SeqCst);
                Ok(())
            })
        }

        fn status(&self) -> String {
            if self.is_running() { "Ready" } else { "" }.to_string()
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn handle<'a>(&'a self, cmd: &'a Cmd) -> BoxFuture<'a, Reply> {
            Box::pin(async move { cmd.reply_ok(serde_json::json!({"Service": self.name})) })
        }
    }

    fn services() -> Vec<(String, Arc<dyn ServiceManager>)> {
        vec![
            ("qan".to_string(), StubManager::new("qan") as Arc<dyn ServiceManager>),
            ("mm".to_string(), StubManager::new("mm") as Arc<dyn ServiceManager>),
        ]
    }

    fn start_cmd(name: &str, id: u64) -> Cmd {
        Cmd {
            id,
            cmd: "StartService".into(),
            data: Some(serde_json::json!({"Name": name, "Config": {}})),
            ..Cmd::default()
        }
    }

    #[tokio::test]
    async fn handle_unknown_command() {
        let services = services();
        let cmd = Cmd {
            cmd: "Reboot".into(),
            ..Cmd::default()
        };
        let reply = handle_service_cmd(&services, &cmd).await;
        assert_eq!(reply.error, "unknown command: Reboot");
    }

    #[tokio::test]
    async fn handle_unknown_service() {
        let services = services();
        let reply = handle_service_cmd(&services, &start_cmd("nope", 1)).await;
        assert_eq!(reply.error, "unknown service: nope");
    }

    #[tokio::test]
    async fn handle_bad_payload_is_decode_error() {
        let services = services();
        let cmd = Cmd {
            cmd: "StartService".into(),
            data: Some(Value::String("not a service data".into())),
            ..Cmd::default()
        };
        let reply = handle_service_cmd(&services, &cmd).await;
        assert!(reply.error.starts_with("bad command payload:"));
    }

    #[tokio::test]
    async fn double_start_reports_already_running() {
        let services = services();
        let first = handle_service_cmd(&services, &start_cmd("qan", 1)).await;
        assert_eq!(first.error, "");

        let second = handle_service_cmd(&services, &start_cmd("qan", 2)).await;
        assert_eq!(second.error, "service qan already running");
    }

    #[tokio::test]
    async fn get_config_routes_by_service_field() {
        let services = services();
        let cmd = Cmd {
            cmd: "GetConfig".into(),
            service: "mm".into(),
            ..Cmd::default()
        };
        let reply = handle_service_cmd(&services, &cmd).await;
        assert_eq!(reply.error, "");
        assert_eq!(reply.data["Service"], "mm");
    }
}
