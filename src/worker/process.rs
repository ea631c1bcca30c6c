//! Child-process worker driver.
//!
//! Each session is one child process speaking newline-delimited JSON over
//! stdin/stdout:
//!
//! ```text
//! -> {"type":"ping"}
//! <- {"type":"pong"}
//! -> {"type":"execute","task_id":"g1:Prompts!C5","prompt":"...","mode":"normal"}
//! <- {"type":"result","success":true,"payload":"..."}
//! ```
//!
//! Lines that are not valid JSON are ignored, so sessions may log to stdout
//! freely. End of stream means the session is gone ([`DriverError::Closed`]);
//! a broken pipe before the first pong means it is still starting
//! ([`DriverError::NotListening`]).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::task::TaskMode;
use crate::worker::{
    DriverError, SessionConfig, SessionHandle, WorkerDriver, WorkerRequest, WorkerResponse,
};

/// How long a readiness probe waits for its pong.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HostMessage<'a> {
    Ping,
    Execute {
        task_id: &'a str,
        prompt: &'a str,
        mode: TaskMode,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SessionMessage {
    Pong,
    Result {
        success: bool,
        #[serde(default)]
        payload: String,
    },
}

#[derive(Debug)]
struct ProcessSession {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    ponged: bool,
}

impl ProcessSession {
    async fn send(&mut self, message: &HostMessage<'_>) -> Result<(), DriverError> {
        let mut line = serde_json::to_vec(message)
            .map_err(|e| DriverError::Protocol(format!("failed to encode message: {e}")))?;
        line.push(b'\n');
        let written = async {
            self.stdin.write_all(&line).await?;
            self.stdin.flush().await
        }
        .await;
        written.map_err(|e| {
            if self.ponged {
                DriverError::Closed(format!("session stdin closed: {e}"))
            } else {
                DriverError::NotListening(format!("session not accepting input yet: {e}"))
            }
        })
    }

    async fn receive(&mut self) -> Result<SessionMessage, DriverError> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .stdout
                .read_line(&mut line)
                .await
                .map_err(|e| DriverError::Transport(format!("failed to read session output: {e}")))?;
            if read == 0 {
                return Err(DriverError::Closed("session output ended".to_string()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(trimmed) {
                Ok(value) => {
                    return serde_json::from_value(value)
                        .map_err(|e| DriverError::Protocol(format!("unexpected session message: {e}")));
                }
                Err(_) => tracing::trace!(line = %trimmed, "ignoring non-JSON session output"),
            }
        }
    }
}

/// Spawns one child process per session from a `[[worker]]` entry.
#[derive(Debug)]
pub struct ProcessDriver {
    config: WorkerConfig,
    sessions: DashMap<Uuid, Arc<Mutex<ProcessSession>>>,
}

impl ProcessDriver {
    /// Creates a driver for `config`.
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
        }
    }

    fn session(&self, handle: &SessionHandle) -> Result<Arc<Mutex<ProcessSession>>, DriverError> {
        self.sessions
            .get(&handle.id)
            .map(|s| s.value().clone())
            .ok_or_else(|| DriverError::Closed(format!("session {} is not running", handle.id)))
    }
}

#[async_trait]
impl WorkerDriver for ProcessDriver {
    async fn start(&self, config: &SessionConfig) -> Result<SessionHandle, DriverError> {
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .envs(&self.config.env)
            .env("SHEETRELAY_SLOT", config.slot.to_string())
            .env("SHEETRELAY_WORKER_TYPE", &config.worker_type)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DriverError::Transport(format!(
                    "failed to spawn '{}': {e}",
                    self.config.command.display()
                ))
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DriverError::Transport("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::Transport("child stdout unavailable".to_string()))?;

        let handle = SessionHandle::new(config);
        tracing::debug!(session = %handle.id, slot = config.slot, pid = ?child.id(), "spawned session process");
        self.sessions.insert(
            handle.id,
            Arc::new(Mutex::new(ProcessSession {
                child,
                stdin,
                stdout: BufReader::new(stdout),
                ponged: false,
            })),
        );
        Ok(handle)
    }

    async fn probe_ready(&self, handle: &SessionHandle) -> bool {
        let Ok(session) = self.session(handle) else {
            return false;
        };
        let mut session = session.lock().await;
        let exchange = async {
            session.send(&HostMessage::Ping).await?;
            session.receive().await
        };
        match tokio::time::timeout(PROBE_TIMEOUT, exchange).await {
            Ok(Ok(SessionMessage::Pong)) => {
                session.ponged = true;
                true
            }
            Ok(Ok(other)) => {
                tracing::debug!(session = %handle.id, ?other, "probe answered with a non-pong message");
                false
            }
            Ok(Err(e)) => {
                tracing::debug!(session = %handle.id, error = %e, "probe failed");
                false
            }
            Err(_) => false,
        }
    }

    async fn execute(
        &self,
        handle: &SessionHandle,
        request: &WorkerRequest,
        timeout: Duration,
    ) -> Result<WorkerResponse, DriverError> {
        let session = self.session(handle)?;
        let mut session = session.lock().await;
        session
            .send(&HostMessage::Execute {
                task_id: &request.task_id,
                prompt: &request.prompt,
                mode: request.mode,
            })
            .await?;
        let reply = tokio::time::timeout(timeout, async {
            loop {
                match session.receive().await? {
                    // Late answers to an earlier probe.
                    SessionMessage::Pong => continue,
                    SessionMessage::Result { success, payload } => {
                        return Ok::<_, DriverError>(WorkerResponse { success, payload });
                    }
                }
            }
        })
        .await;
        match reply {
            Ok(result) => result,
            Err(_) => Err(DriverError::Transport(format!(
                "no result within {}s",
                timeout.as_secs()
            ))),
        }
    }

    async fn stop(&self, handle: &SessionHandle) {
        let Some((_, session)) = self.sessions.remove(&handle.id) else {
            return;
        };
        let mut session = session.lock().await;
        if let Err(e) = session.child.kill().await {
            tracing::debug!(session = %handle.id, error = %e, "session process already gone");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    const ECHO_SESSION: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"ping"'*) echo '{"type":"pong"}' ;;
    *'"execute"'*) echo 'thinking...'; echo '{"type":"result","success":true,"payload":"forty-two"}' ;;
  esac
done
"#;

    fn driver(script: &str) -> ProcessDriver {
        ProcessDriver::new(WorkerConfig {
            worker_type: "sh".into(),
            command: PathBuf::from("sh"),
            args: vec!["-c".into(), script.into()],
            env: HashMap::new(),
        })
    }

    fn config() -> SessionConfig {
        SessionConfig {
            worker_type: "sh".into(),
            slot: 0,
        }
    }

    fn request() -> WorkerRequest {
        WorkerRequest {
            task_id: "g1:C5".into(),
            prompt: "question".into(),
            mode: TaskMode::Normal,
        }
    }

    #[tokio::test]
    async fn ping_then_execute() {
        let driver = driver(ECHO_SESSION);
        let handle = driver.start(&config()).await.unwrap();
        assert!(driver.probe_ready(&handle).await);
        let response = driver
            .execute(&handle, &request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            response,
            WorkerResponse {
                success: true,
                payload: "forty-two".into()
            }
        );
        driver.stop(&handle).await;
        assert!(!driver.probe_ready(&handle).await);
    }

    #[tokio::test]
    async fn exited_session_is_closed() {
        let driver = driver("read -r line; exit 0");
        let handle = driver.start(&config()).await.unwrap();
        let err = driver
            .execute(&handle, &request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(
            matches!(err, DriverError::Closed(_) | DriverError::NotListening(_)),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn missing_program_fails_to_start() {
        let driver = ProcessDriver::new(WorkerConfig {
            worker_type: "none".into(),
            command: PathBuf::from("/nonexistent/sheetrelay-session"),
            args: vec![],
            env: HashMap::new(),
        });
        assert!(matches!(
            driver.start(&config()).await,
            Err(DriverError::Transport(_))
        ));
    }
}
