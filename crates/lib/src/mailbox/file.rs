//! File-backed mailbox.
//!
//! Writers go through a temp file + rename so a slot is never observed half-written by this side.
//! Readers claim a slot by renaming it to a unique name before reading, so when several pollers race
//! for the same slot exactly one of them gets it.

use super::{InboundRequest, Mailbox, MailboxError, OutboundReply};
use crate::config::MailboxConfig;
use async_trait::async_trait;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const REQUEST_SLOT: &str = "request";
const REPLY_SLOT: &str = "reply";

/// A reply that fails to parse is left alone while it is younger than this (the writer may still be mid-write).
const DEFAULT_MALFORMED_GRACE: Duration = Duration::from_secs(1);

/// Which side of the mailbox a process plays. Each role may be attached by one process at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxRole {
    /// The bridge: publishes requests, consumes replies.
    Producer,
    /// The external decision process: consumes requests, posts replies.
    Consumer,
}

impl MailboxRole {
    fn name(self) -> &'static str {
        match self {
            MailboxRole::Producer => "producer",
            MailboxRole::Consumer => "consumer",
        }
    }

    fn lock_file(self) -> &'static str {
        match self {
            MailboxRole::Producer => ".producer.lock",
            MailboxRole::Consumer => ".consumer.lock",
        }
    }
}

/// Exclusive hold on a mailbox role; released on drop.
#[derive(Debug)]
pub struct RoleLock {
    file: File,
    role: MailboxRole,
}

impl RoleLock {
    pub fn role(&self) -> MailboxRole {
        self.role
    }
}

impl Drop for RoleLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Mailbox stored as two JSON files in one directory.
#[derive(Debug, Clone)]
pub struct FileMailbox {
    dir: PathBuf,
    request_path: PathBuf,
    reply_path: PathBuf,
    malformed_grace: Duration,
}

impl FileMailbox {
    pub fn new(dir: impl Into<PathBuf>, request_file: &str, reply_file: &str) -> Self {
        let dir = dir.into();
        Self {
            request_path: dir.join(request_file),
            reply_path: dir.join(reply_file),
            dir,
            malformed_grace: DEFAULT_MALFORMED_GRACE,
        }
    }

    /// Build from the mailbox config section; `dir` is the already-resolved directory.
    pub fn from_config(config: &MailboxConfig, dir: impl Into<PathBuf>) -> Self {
        Self::new(dir, &config.request_file, &config.reply_file)
    }

    /// How long an unparseable reply is given to finish being written before it is discarded.
    pub fn with_malformed_grace(mut self, grace: Duration) -> Self {
        self.malformed_grace = grace;
        self
    }

    pub fn request_path(&self) -> &Path {
        &self.request_path
    }

    pub fn reply_path(&self) -> &Path {
        &self.reply_path
    }

    pub fn ensure_dir(&self) -> Result<(), MailboxError> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Attach as `role`. Fails with `Busy` when another process already holds that role.
    pub fn attach(&self, role: MailboxRole) -> Result<RoleLock, MailboxError> {
        self.ensure_dir()?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(role.lock_file()))?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(RoleLock { file, role }),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(MailboxError::Busy(role.name()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn has_pending_request(&self) -> bool {
        self.request_path.exists()
    }

    /// Write `request` as the pending item (last write wins). A leftover reply from an earlier
    /// exchange is discarded first so it cannot be matched to this request.
    pub fn write_request(&self, request: &InboundRequest) -> Result<(), MailboxError> {
        if self.clear_stale_reply()? {
            log::warn!("mailbox: discarded stale reply before publishing a new request");
        }
        if self.has_pending_request() {
            log::warn!(
                "mailbox: overwriting unconsumed request in {}",
                self.request_path.display()
            );
        }
        self.write_slot(&self.request_path, request)
    }

    /// Consumer side: claim and remove the pending request.
    /// A malformed request is removed as well and reported as `Malformed`.
    pub fn take_request(&self) -> Result<Option<InboundRequest>, MailboxError> {
        let Some(bytes) = self.claim(&self.request_path)? else {
            return Ok(None);
        };
        parse_slot::<InboundRequest>(&bytes)
            .and_then(|r| r.validate().map(|_| r))
            .map(Some)
            .map_err(|reason| MailboxError::Malformed {
                slot: REQUEST_SLOT,
                reason,
            })
    }

    /// Consumer side: write the reply slot.
    pub fn post_reply(&self, reply: &OutboundReply) -> Result<(), MailboxError> {
        self.write_slot(&self.reply_path, reply)
    }

    /// Claim the reply if one is ready. Malformed replies are discarded (once past the grace period)
    /// and reported as "nothing yet" so the caller keeps polling.
    pub fn try_take_reply(&self) -> Result<Option<OutboundReply>, MailboxError> {
        let peeked = match fs::read(&self.reply_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if let Err(reason) = parse_reply(&peeked) {
            if self.recently_modified(&self.reply_path) {
                log::debug!("mailbox: {} slot not parseable yet ({}), waiting", REPLY_SLOT, reason);
                return Ok(None);
            }
            if self.claim(&self.reply_path)?.is_some() {
                log::warn!(
                    "mailbox: discarded malformed {} in {}: {}",
                    REPLY_SLOT,
                    self.reply_path.display(),
                    reason
                );
            }
            return Ok(None);
        }
        let Some(bytes) = self.claim(&self.reply_path)? else {
            // Another poller claimed it first.
            return Ok(None);
        };
        match parse_reply(&bytes) {
            Ok(reply) => Ok(Some(reply)),
            Err(reason) => {
                log::warn!("mailbox: discarded malformed {}: {}", REPLY_SLOT, reason);
                Ok(None)
            }
        }
    }

    /// Remove a reply left over from an earlier exchange. Returns whether one was present.
    pub fn clear_stale_reply(&self) -> Result<bool, MailboxError> {
        Ok(self.claim(&self.reply_path)?.is_some())
    }

    fn recently_modified(&self, path: &Path) -> bool {
        let Ok(modified) = fs::metadata(path).and_then(|m| m.modified()) else {
            return false;
        };
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age < self.malformed_grace)
            .unwrap_or(false)
    }

    fn write_slot<T: Serialize>(&self, target: &Path, item: &T) -> Result<(), MailboxError> {
        let bytes = serde_json::to_vec(item)?;
        self.ensure_dir()?;
        let tmp = self.sibling(target, "tmp");
        let written = File::create(&tmp).and_then(|mut f| {
            f.write_all(&bytes)?;
            f.sync_all()
        });
        if let Err(e) = written.and_then(|_| fs::rename(&tmp, target)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Atomically take ownership of `slot` and return its bytes. `None` when the slot is empty
    /// (or another reader got there first). No await points: dropping the caller cannot strand a claim.
    fn claim(&self, slot: &Path) -> io::Result<Option<Vec<u8>>> {
        let claimed = self.sibling(slot, "claim");
        match fs::rename(slot, &claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        }
        let bytes = fs::read(&claimed);
        let _ = fs::remove_file(&claimed);
        bytes.map(Some)
    }

    fn sibling(&self, slot: &Path, suffix: &str) -> PathBuf {
        let name = slot
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "slot".to_string());
        self.dir
            .join(format!(".{}.{}.{}", name, uuid::Uuid::new_v4(), suffix))
    }

    async fn poll_reply(&self, poll_interval: Duration) -> Result<OutboundReply, MailboxError> {
        let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Some(reply) = self.try_take_reply()? {
                return Ok(reply);
            }
        }
    }
}

fn parse_slot<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, String> {
    serde_json::from_slice(bytes).map_err(|e| e.to_string())
}

fn parse_reply(bytes: &[u8]) -> Result<OutboundReply, String> {
    let reply: OutboundReply = parse_slot(bytes)?;
    reply.validate()?;
    Ok(reply)
}

#[async_trait]
impl Mailbox for FileMailbox {
    async fn publish(&self, request: &InboundRequest) -> Result<(), MailboxError> {
        self.write_request(request)
    }

    async fn await_reply(
        &self,
        poll_interval: Duration,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<OutboundReply, MailboxError> {
        let poll = self.poll_reply(poll_interval);
        let bounded = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, poll)
                    .await
                    .unwrap_or(Err(MailboxError::Timeout(limit))),
                None => poll.await,
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MailboxError::Cancelled),
            result = bounded => result,
        }
    }

    async fn withdraw(&self) -> Result<bool, MailboxError> {
        Ok(self.claim(&self.request_path)?.is_some())
    }
}
