//! Posting groups
//!
//! A group collects the postings that share a uid until the declared count
//! is reached, then receives exactly one outcome which is fanned out to
//! every waiter. The group itself never touches storage; the engine drives
//! commit, timeout expiry and removal.

use crate::{types::Posting, Error, Result};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

/// Handle on the eventual outcome of one submitted posting
#[derive(Debug)]
pub struct Waiter {
    rx: oneshot::Receiver<Result<()>>,
}

impl Waiter {
    /// Wait for the group's outcome
    pub async fn wait(self) -> Result<()> {
        self.rx.await.map_err(|_| {
            Error::Internal("posting group dropped without an outcome".to_string())
        })?
    }
}

/// Transient accumulator for one uid
#[derive(Debug)]
pub struct PostingGroup {
    uid: String,
    postings: Vec<Posting>,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    resolved: bool,

    /// Dropped on the terminal call; wakes the timer so it exits early
    disarm: Option<oneshot::Sender<()>>,
    disarmed: Option<oneshot::Receiver<()>>,
}

impl PostingGroup {
    /// Create an empty group; `timeout` of `None` never expires
    pub fn new(uid: impl Into<String>, timeout: Option<Duration>) -> Self {
        let (disarm, disarmed) = oneshot::channel();
        Self {
            uid: uid.into(),
            postings: Vec::new(),
            waiters: Vec::new(),
            timeout,
            deadline: None,
            resolved: false,
            disarm: Some(disarm),
            disarmed: Some(disarmed),
        }
    }

    /// Uid this group correlates
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Register a posting and rearm the deadline
    pub fn add(&mut self, posting: Posting) -> Waiter {
        let (tx, rx) = oneshot::channel();
        self.postings.push(posting);
        self.waiters.push(tx);
        self.deadline = self.timeout.map(|t| Instant::now() + t);
        Waiter { rx }
    }

    /// All declared postings have arrived
    ///
    /// Compares against the largest declared count rather than the first
    /// one seen, so a stray small count is superseded by later postings and
    /// surfaces as a `CountMismatch` instead of committing early.
    pub fn is_ready(&self) -> bool {
        match self.postings.iter().map(|p| p.count).max() {
            Some(max_count) => self.postings.len() >= max_count as usize,
            None => false,
        }
    }

    /// Postings collected so far, in arrival order
    pub fn postings(&self) -> &[Posting] {
        &self.postings
    }

    /// Number of waiters still owed an outcome
    pub fn pending_waiters(&self) -> usize {
        self.waiters.len()
    }

    /// Succeeded, failed or timed out
    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Current deadline, if the group can time out
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Deliver success to every waiter
    pub fn succeed(&mut self) {
        self.resolve(Ok(()));
    }

    /// Deliver `error` to every waiter
    pub fn fail(&mut self, error: Error) {
        self.resolve(Err(error));
    }

    /// Fail every waiter with [`Error::GroupTimeout`], logging the postings
    pub fn expire(&mut self) {
        tracing::error!(
            uid = %self.uid,
            received = self.postings.len(),
            "Posting group timed out"
        );
        self.log_postings();
        self.fail(Error::GroupTimeout);
    }

    /// Log every posting for forensic replay
    pub fn log_postings(&self) {
        for posting in &self.postings {
            let posting = serde_json::to_string(posting).unwrap_or_else(|e| e.to_string());
            tracing::error!(uid = %self.uid, %posting, "Posting");
        }
    }

    /// Take the timer's disarm receiver; `None` when the group never times
    /// out or the timer was already started
    pub(crate) fn take_timer(&mut self) -> Option<oneshot::Receiver<()>> {
        self.timeout?;
        self.disarmed.take()
    }

    fn resolve(&mut self, outcome: Result<()>) {
        if self.resolved {
            return;
        }
        self.resolved = true;
        self.deadline = None;
        self.disarm.take();

        for waiter in self.waiters.drain(..) {
            // A caller that stopped waiting is not an error
            let _ = waiter.send(outcome.clone());
        }
    }
}
