/// kubectl/nhctl backed collaborators for the command line front end

use async_trait::async_trait;
use livesession::process::PipedProcess;
use livesession::{
    AttachRequest, AttachUi, AttachedSession, DebugTarget, RemoteCommandBuilder, SessionError,
    SpawnCommand, SyncFeed, Tunnel, TunnelProvider,
};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;

const FORWARD_READY_TIMEOUT: Duration = Duration::from_secs(30);

fn with_kubeconfig(command: SpawnCommand, target: &DebugTarget) -> SpawnCommand {
    let command = command.args(["-n", target.namespace.as_str()]);
    match &target.kubeconfig_path {
        Some(path) => command.arg("--kubeconfig").arg(path.to_string_lossy()),
        None => command,
    }
}

fn workload_ref(target: &DebugTarget) -> String {
    format!("{}/{}", target.resource_type, target.workload_name)
}

/// Extract the local port from kubectl's "Forwarding from 127.0.0.1:PORT -> N"
fn parse_forwarded_port(line: &str) -> Option<u16> {
    let rest = line.strip_prefix("Forwarding from ")?;
    let (address, _) = rest.split_once(" -> ")?;
    let (_, port) = address.rsplit_once(':')?;
    port.trim().parse().ok()
}

/// `kubectl port-forward` to the workload
pub struct KubectlTunnel {
    pub local_port: u16,
}

#[async_trait]
impl TunnelProvider for KubectlTunnel {
    async fn open(&self, target: &DebugTarget, remote_port: u16) -> livesession::Result<Tunnel> {
        let command = with_kubeconfig(
            SpawnCommand::new("kubectl").args([
                "port-forward".to_string(),
                workload_ref(target),
                format!("{}:{}", self.local_port, remote_port),
                "--address".to_string(),
                "127.0.0.1".to_string(),
            ]),
            target,
        );
        let mut process = PipedProcess::start(&command)
            .map_err(|e| SessionError::TunnelUnavailable(format!("{}: {}", command.program, e)))?;
        let stdout = process
            .take_stdout()
            .ok_or_else(|| SessionError::TunnelUnavailable("port-forward has no stdout".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let wait_ready = async {
            while let Some(line) = lines.next_line().await? {
                log::debug!("port-forward: {}", line);
                if let Some(port) = parse_forwarded_port(&line) {
                    return Ok(Some(port));
                }
            }
            Ok::<_, std::io::Error>(None)
        };
        let port = match tokio::time::timeout(FORWARD_READY_TIMEOUT, wait_ready).await {
            Ok(Ok(Some(port))) => port,
            Ok(Ok(None)) => {
                return Err(SessionError::TunnelUnavailable(
                    "port-forward exited before forwarding".into(),
                ))
            }
            Ok(Err(e)) => return Err(SessionError::TunnelUnavailable(e.to_string())),
            Err(_) => {
                return Err(SessionError::TunnelUnavailable(format!(
                    "port-forward not ready after {:?}",
                    FORWARD_READY_TIMEOUT
                )))
            }
        };

        // keep the pipe drained, kubectl blocks once it fills
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                log::trace!("port-forward: {}", line);
            }
        });

        let mut child = process.into_child();
        Ok(Tunnel::new("127.0.0.1", port).with_disposer(move || {
            if let Err(e) = child.start_kill() {
                log::debug!("port-forward already gone: {}", e);
            }
        }))
    }
}

/// `kubectl exec` into the dev container, `nhctl sync-status` for file sync
pub struct KubectlCommands;

impl RemoteCommandBuilder for KubectlCommands {
    fn exec(&self, target: &DebugTarget, shell_command: &str) -> SpawnCommand {
        with_kubeconfig(
            SpawnCommand::new("kubectl").args([
                "exec".to_string(),
                "-i".to_string(),
                workload_ref(target),
                "-c".to_string(),
                target.container_name.clone(),
            ]),
            target,
        )
        .args(["--", "sh", "-c"])
        .arg(format!("cd {} && {}", target.work_dir, shell_command))
    }

    fn sync_status(&self, target: &DebugTarget) -> Option<SyncFeed> {
        let command = with_kubeconfig(
            SpawnCommand::new("nhctl").args(["sync-status", target.workload_name.as_str()]),
            target,
        )
        .args(["--controller-type", target.resource_type.as_str(), "--watch"]);
        Some(SyncFeed::Process(command))
    }
}

/// Prints where to attach and waits for Ctrl-C
#[derive(Default)]
pub struct ConsoleAttach {
    sessions: Mutex<Vec<oneshot::Sender<()>>>,
}

#[async_trait]
impl AttachUi for ConsoleAttach {
    async fn attach(&self, request: &AttachRequest) -> livesession::Result<AttachedSession> {
        println!(
            "Debugger ready ({}): attach to {}:{}, remote sources in {}",
            request.variant, request.host, request.port, request.remote_working_dir
        );
        let (session, ended) = AttachedSession::channel();
        self.sessions.lock().unwrap().push(ended);
        Ok(session)
    }

    async fn stop(&self, session_name: &str) {
        log::info!("Debugger for {} detached, re-attach once it is ready again", session_name);
        self.sessions.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> DebugTarget {
        DebugTarget {
            namespace: "dev".to_string(),
            workload_name: "api".to_string(),
            resource_type: "deployment".to_string(),
            container_name: "nocalhost-dev".to_string(),
            kubeconfig_path: Some("/home/me/.kube/dev".into()),
            work_dir: "/home/nocalhost-dev".to_string(),
        }
    }

    #[test]
    fn test_parse_forwarded_port() {
        assert_eq!(parse_forwarded_port("Forwarding from 127.0.0.1:54321 -> 5005"), Some(54321));
        assert_eq!(parse_forwarded_port("Forwarding from [::1]:54321 -> 5005"), Some(54321));
        assert_eq!(parse_forwarded_port("Handling connection for 54321"), None);
    }

    #[test]
    fn test_exec_command_line() {
        let command = KubectlCommands.exec(&target(), "dlv debug --headless --listen=:2345");
        assert_eq!(
            command.to_string(),
            "kubectl exec -i deployment/api -c nocalhost-dev -n dev --kubeconfig /home/me/.kube/dev -- sh -c \"cd /home/nocalhost-dev && dlv debug --headless --listen=:2345\""
        );
    }

    #[test]
    fn test_sync_status_command_line() {
        match KubectlCommands.sync_status(&target()) {
            Some(SyncFeed::Process(command)) => assert_eq!(
                command.to_string(),
                "nhctl sync-status api -n dev --kubeconfig /home/me/.kube/dev --controller-type deployment --watch"
            ),
            _ => panic!("expected a sync-status process"),
        }
    }
}
