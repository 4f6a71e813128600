// Process-pipe transport: newline-delimited JSON-RPC over a child's stdin/stdout.
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::transports::{InboundMessage, InboundReceiver, InboundSlot, SendOptions, Transport};

const KILL_GRACE: Duration = Duration::from_secs(2);

pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    inbound: InboundSlot,
}

impl StdioTransport {
    pub fn new(
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        working_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            command,
            args,
            env,
            working_dir,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            readers: Mutex::new(Vec::new()),
            inbound: InboundSlot::default(),
        }
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self) -> Result<InboundReceiver> {
        let mut child = self
            .build_command()
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn '{}': {}", self.command, e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Failed to get stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to get stdout"))?;
        let stderr = child.stderr.take();

        let (tx, rx) = self.inbound.open_owned()?;
        let command = self.command.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(line) {
                            Ok(message) => {
                                if tx.send(InboundMessage::new(message)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(command = %command, error = %e, "Skipping non-JSON stdout line");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(command = %command, error = %e, "Failed to read from stdout");
                        break;
                    }
                }
            }
        });

        let mut readers = self.readers.lock().await;
        readers.push(stdout_task);
        if let Some(stderr) = stderr {
            let command = self.command.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(command = %command, "stderr: {}", line);
                }
            }));
        }
        drop(readers);

        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);
        Ok(rx)
    }

    async fn send(&self, message: Value, _options: SendOptions) -> Result<()> {
        let request_str = serde_json::to_string(&message)?;

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| anyhow!("Process '{}' is not running", self.command))?;
        stdin.write_all(request_str.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Closing stdin asks well-behaved servers to exit on their own.
        self.stdin.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    child.start_kill()?;
                    let _ = child.wait().await;
                }
            }
        }

        for reader in self.readers.lock().await.drain(..) {
            reader.abort();
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "process_pipe"
    }
}
