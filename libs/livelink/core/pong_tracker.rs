//! Ping/pong bookkeeping
//!
//! Tracks the single outstanding heartbeat ping of a connection epoch and
//! decides whether an incoming pong answers it. A connection is dead when
//! the outstanding ping's deadline passes without a matching pong.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    seq: u64,
    sent_at: Instant,
    deadline: Instant,
}

/// What an incoming pong meant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PongOutcome {
    /// Answered the outstanding ping
    Matched { rtt: Duration },
    /// Answered a ping that is no longer outstanding
    Stale,
    /// Sequence number was never issued
    Unexpected,
}

/// Outstanding-ping tracker, owned by the connection driver
///
/// Sequence numbers start at 1 and grow monotonically for the lifetime of
/// the tracker. Only the most recent ping is outstanding; a pong for an
/// older sequence number is stale and ignored.
#[derive(Debug)]
pub struct PingTracker {
    timeout: Duration,
    next_seq: u64,
    outstanding: Option<Outstanding>,
}

impl PingTracker {
    /// # Arguments
    /// * `timeout` - How long a ping may stay unanswered
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            next_seq: 1,
            outstanding: None,
        }
    }

    /// Issue the next sequence number and start its deadline
    pub fn next_ping(&mut self, now: Instant) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.outstanding = Some(Outstanding {
            seq,
            sent_at: now,
            deadline: now + self.timeout,
        });
        seq
    }

    pub fn on_pong(&mut self, seq: u64, now: Instant) -> PongOutcome {
        match self.outstanding {
            Some(ping) if ping.seq == seq => {
                let rtt = now.saturating_duration_since(ping.sent_at);
                self.outstanding = None;
                PongOutcome::Matched { rtt }
            }
            _ if seq > 0 && seq < self.next_seq => PongOutcome::Stale,
            _ => PongOutcome::Unexpected,
        }
    }

    /// Deadline of the outstanding ping, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.outstanding.map(|ping| ping.deadline)
    }

    pub fn outstanding_seq(&self) -> Option<u64> {
        self.outstanding.map(|ping| ping.seq)
    }
}
