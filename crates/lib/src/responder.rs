//! Consumer side of the mailbox: take each request, produce a reply, post it.
//!
//! A [`Responder`] turns one request into reply text. `wabridge respond --exec CMD...` runs a command
//! per message (request text on stdin, reply on stdout); `--echo` sends the text back unchanged.

use crate::mailbox::{FileMailbox, InboundRequest, MailboxError, OutboundReply};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Pause after a failed reply before taking the next request.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

#[async_trait]
pub trait Responder: Send + Sync {
    /// Reply text for `request`. An error means no reply is posted.
    async fn respond(&self, request: &InboundRequest) -> Result<String, String>;
}

/// Replies with the request text.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoResponder;

#[async_trait]
impl Responder for EchoResponder {
    async fn respond(&self, request: &InboundRequest) -> Result<String, String> {
        Ok(request.text.clone())
    }
}

/// Runs `program args...` per request. No shell is involved. The sender's id is passed in
/// `WABRIDGE_USER`, the text on stdin; trimmed stdout is the reply.
#[derive(Debug, Clone)]
pub struct CommandResponder {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandResponder {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Build from a full argv (`["python3", "brain.py"]`). `None` when empty.
    pub fn from_argv(argv: Vec<String>) -> Option<Self> {
        let mut argv = argv.into_iter();
        let program = argv.next().filter(|p| !p.trim().is_empty())?;
        Some(Self::new(program, argv.collect()))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Responder for CommandResponder {
    async fn respond(&self, request: &InboundRequest) -> Result<String, String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("WABRIDGE_USER", &request.user)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("exec {} failed: {}", self.program, e))?;
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(request.text.as_bytes()).await {
                // The command exited without reading all of its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                r => r,
            }
        };
        let (fed, output) =
            tokio::time::timeout(self.timeout, async { tokio::join!(feed, child.wait_with_output()) })
                .await
                .map_err(|_| format!("{} timed out after {:?}", self.program, self.timeout))?;
        fed.map_err(|e| format!("writing to {}: {}", self.program, e))?;
        let output = output.map_err(|e| format!("waiting for {}: {}", self.program, e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("exit {}: {}", output.status, stderr.trim()));
        }
        let reply = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if reply.is_empty() {
            return Err(format!("{} produced no output", self.program));
        }
        Ok(reply)
    }
}

/// Poll `mailbox` for requests and answer each one until `shutdown`. Returns the number of replies
/// posted. Malformed requests are dropped; a failed responder is logged and no reply is written.
pub async fn run_responder(
    mailbox: &FileMailbox,
    responder: &dyn Responder,
    poll_interval: Duration,
    shutdown: CancellationToken,
) -> Result<u64, MailboxError> {
    let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut replied = 0u64;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let request = match mailbox.take_request() {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(MailboxError::Malformed { reason, .. }) => {
                log::warn!("responder: dropped malformed request: {}", reason);
                continue;
            }
            Err(e) => return Err(e),
        };
        log::info!("responder: request from {}", request.user);
        let answered = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = responder.respond(&request) => r,
        };
        match answered {
            Ok(text) => {
                mailbox.post_reply(&OutboundReply::new(request.user.clone(), text))?;
                replied += 1;
                log::info!("responder: reply posted for {}", request.user);
            }
            Err(e) => {
                log::error!("responder: no reply for {}: {}", request.user, e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }
    Ok(replied)
}
