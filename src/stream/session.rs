//! Stream Session
//!
//! The cancellable token-emission loop behind one generation request. A
//! session writes one token per chunk, paced by a random delay, until it hits
//! its deadline, its token cap, the caller's remaining quota, the stop token,
//! or cancellation. Every path yields a [`SessionOutcome`].

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::vocabulary;

/// Default wall-clock bound for one stream
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(1000);

/// Per-request stream options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    pub deadline: Duration,
    pub max_tokens: Option<u64>,
    /// Ends the stream after it is emitted; matched case-sensitively
    pub stop_token: Option<String>,
    /// Seeds the token sequence; OS entropy when absent
    pub seed: Option<u64>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            max_tokens: None,
            stop_token: None,
            seed: None,
        }
    }
}

/// Delay between tokens, uniform in `[min, max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub min: Duration,
    pub max: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_DELAY,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

impl Pacing {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    /// No delay between tokens
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let min = self.min.as_nanos() as u64;
        let max = self.max.as_nanos() as u64;
        Duration::from_nanos(rng.random_range(min..max))
    }
}

/// Why a session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationReason {
    Deadline,
    MaxTokens,
    QuotaExhausted,
    StopToken,
    Cancelled,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Deadline => "deadline",
            TerminationReason::MaxTokens => "max_tokens",
            TerminationReason::QuotaExhausted => "quota_exhausted",
            TerminationReason::StopToken => "stop_token",
            TerminationReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one finished session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub user_id: String,
    pub tokens: Vec<String>,
    pub token_count: u64,
    pub wall_duration: Duration,
    pub termination: TerminationReason,
}

impl SessionOutcome {
    /// Emitted tokens joined by single spaces
    pub fn emitted_text(&self) -> String {
        self.tokens.join(" ")
    }
}

/// The receiver side is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("token sink closed")]
pub struct SinkClosed;

/// Outgoing chunk channel; each chunk becomes one body frame
#[derive(Debug, Clone)]
pub struct TokenSink {
    tx: mpsc::Sender<Bytes>,
}

impl TokenSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }

    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }

    pub async fn write(&self, chunk: Bytes) -> Result<(), SinkClosed> {
        self.tx.send(chunk).await.map_err(|_| SinkClosed)
    }

    /// Resolves once the receiver has been dropped
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Token-emission loop with fixed pacing
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamSession {
    pacing: Pacing,
}

impl StreamSession {
    pub fn new(pacing: Pacing) -> Self {
        Self { pacing }
    }

    /// Emit tokens for `user_id` bounded by `words_left` and `options`
    pub async fn run(
        &self,
        user_id: &str,
        words_left: u64,
        options: &StreamOptions,
        sink: &TokenSink,
        cancel: &CancellationToken,
    ) -> SessionOutcome {
        let start = Instant::now();
        let deadline = start + options.deadline;

        // Pacing draws from its own generator so the token sequence depends only on the seed
        let mut token_rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let mut pacing_rng = StdRng::from_os_rng();

        let cap_reached = |count: u64| -> Option<TerminationReason> {
            if options.max_tokens.is_some_and(|max| count >= max) {
                Some(TerminationReason::MaxTokens)
            } else if count >= words_left {
                Some(TerminationReason::QuotaExhausted)
            } else {
                None
            }
        };

        let mut tokens: Vec<String> = Vec::new();

        let termination = loop {
            if cancel.is_cancelled() || sink.is_closed() {
                break TerminationReason::Cancelled;
            }
            if Instant::now() >= deadline {
                break TerminationReason::Deadline;
            }
            if let Some(reason) = cap_reached(tokens.len() as u64) {
                break reason;
            }

            let token = vocabulary::draw(&mut token_rng);
            let written = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TerminationReason::Cancelled),
                _ = sleep_until(deadline) => Err(TerminationReason::Deadline),
                result = sink.write(Bytes::from(format!("{} ", token))) => {
                    result.map_err(|_| TerminationReason::Cancelled)
                }
            };
            if let Err(reason) = written {
                break reason;
            }
            tokens.push(token.to_string());

            if options.stop_token.as_deref() == Some(token) {
                break TerminationReason::StopToken;
            }
            if let Some(reason) = cap_reached(tokens.len() as u64) {
                break reason;
            }

            let wake = (Instant::now() + self.pacing.draw(&mut pacing_rng)).min(deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break TerminationReason::Cancelled,
                _ = sink.closed() => break TerminationReason::Cancelled,
                _ = sleep_until(wake) => {}
            }
        };

        let outcome = SessionOutcome {
            user_id: user_id.to_string(),
            token_count: tokens.len() as u64,
            tokens,
            wall_duration: start.elapsed(),
            termination,
        };

        debug!(
            user_id = %user_id,
            token_count = outcome.token_count,
            termination = %outcome.termination,
            duration_ms = outcome.wall_duration.as_millis() as u64,
            "Stream session finished"
        );

        outcome
    }
}
