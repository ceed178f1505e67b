//! Per-connection table of in-flight operations.
//!
//! The table is owned by a [`crate::Connection`] behind a mutex. Pending counters are
//! kept in lockstep with the maps: every insert and removal updates both under the
//! same lock.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::Result;
use crate::protocol::{CallResponse, OperationId};

/// Single-assignment completion of an outbound operation.
pub type Completion = oneshot::Sender<Result<CallResponse>>;

/// Outbound operation awaiting its response.
#[derive(Debug)]
pub struct OutboundOp {
    pub(crate) started: Instant,
    pub(crate) ttl: Duration,
    pub(crate) timed_out: bool,
    pub(crate) completion: Option<Completion>,
}

impl OutboundOp {
    /// An op started at `started` that completes through `completion`.
    pub fn new(started: Instant, ttl: Duration, completion: Completion) -> Self {
        Self {
            started,
            ttl,
            timed_out: false,
            completion: Some(completion),
        }
    }

    /// Takes the completion, leaving the op answered.
    pub fn take_completion(&mut self) -> Option<Completion> {
        self.completion.take()
    }
}

/// Inbound operation being served by a handler.
#[derive(Debug, Clone, Copy)]
pub struct InboundOp {
    pub(crate) started: Instant,
}

/// Number of in-flight operations per direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Pending {
    /// Calls being served.
    pub inbound: usize,
    /// Calls awaiting responses.
    pub outbound: usize,
}

/// Outbound operation that just ran past its TTL.
#[derive(Debug)]
pub struct Expired {
    /// Operation id.
    pub id: OperationId,
    /// Time since the op started.
    pub elapsed: Duration,
    /// TTL it was sent with.
    pub ttl: Duration,
    /// Sender the caller is waiting on.
    pub completion: Completion,
}

/// Result of one sweep over the table.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Operations that expired on this sweep; their callers must be failed.
    pub expired: Vec<Expired>,
    /// Operations that were already flagged timed out yet still present.
    pub purged: Vec<OperationId>,
    /// Inbound operations dropped for exceeding the server timeout.
    pub dropped_inbound: usize,
}

/// Inbound and outbound operations of one connection.
#[derive(Debug, Default)]
pub struct OperationTable {
    outbound: HashMap<OperationId, OutboundOp>,
    inbound: HashMap<OperationId, InboundOp>,
    pending: Pending,
    last_timeout_at: Option<Instant>,
}

impl OperationTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// In-flight counts.
    pub fn pending(&self) -> Pending {
        self.pending
    }

    /// Whether `id` is an outstanding outbound op.
    pub fn contains_outbound(&self, id: OperationId) -> bool {
        self.outbound.contains_key(&id)
    }

    /// Registers an outbound op. Returns false if the id is already in use.
    pub fn insert_outbound(&mut self, id: OperationId, op: OutboundOp) -> bool {
        if self.outbound.contains_key(&id) {
            return false;
        }
        self.outbound.insert(id, op);
        self.pending.outbound += 1;
        true
    }

    /// Removes an answered outbound op.
    pub fn pop_outbound(&mut self, id: OperationId) -> Option<OutboundOp> {
        let op = self.outbound.remove(&id)?;
        self.pending.outbound -= 1;
        Some(op)
    }

    /// Registers an inbound op. Returns false if the id is already in use.
    pub fn insert_inbound(&mut self, id: OperationId, started: Instant) -> bool {
        if self.inbound.contains_key(&id) {
            return false;
        }
        self.inbound.insert(id, InboundOp { started });
        self.pending.inbound += 1;
        true
    }

    /// Removes an answered inbound op.
    pub fn pop_inbound(&mut self, id: OperationId) -> Option<InboundOp> {
        let op = self.inbound.remove(&id)?;
        self.pending.inbound -= 1;
        Some(op)
    }

    /// Removes an outbound op that its caller gave up on, recording a timeout.
    pub fn expire_outbound(&mut self, id: OperationId, now: Instant) -> Option<OutboundOp> {
        let op = self.pop_outbound(id)?;
        self.last_timeout_at = Some(now);
        Some(op)
    }

    /// Time of the most recent outbound timeout not yet followed by a received frame.
    pub fn last_timeout_at(&self) -> Option<Instant> {
        self.last_timeout_at
    }

    /// Any received frame proves the link is alive.
    pub fn note_frame_received(&mut self) {
        self.last_timeout_at = None;
    }

    /// Expires outbound ops past their TTL and inbound ops older than `server_timeout`.
    ///
    /// An op whose caller dropped its receiver is flagged on one sweep and purged on
    /// the next.
    pub fn sweep(&mut self, now: Instant, server_timeout: Duration) -> SweepReport {
        let mut report = SweepReport::default();

        self.outbound.retain(|&id, op| {
            if op.timed_out {
                report.purged.push(id);
                return false;
            }
            let elapsed = now.saturating_duration_since(op.started);
            if elapsed <= op.ttl {
                if op.completion.as_ref().map_or(false, Completion::is_closed) {
                    op.timed_out = true;
                }
                return true;
            }
            op.timed_out = true;
            if let Some(completion) = op.completion.take() {
                report.expired.push(Expired {
                    id,
                    elapsed,
                    ttl: op.ttl,
                    completion,
                });
            }
            false
        });
        self.pending.outbound = self.outbound.len();
        if !report.expired.is_empty() {
            self.last_timeout_at = Some(now);
        }

        let before = self.inbound.len();
        self.inbound
            .retain(|_, op| now.saturating_duration_since(op.started) <= server_timeout);
        report.dropped_inbound = before - self.inbound.len();
        self.pending.inbound = self.inbound.len();

        report
    }

    /// Empties both maps, returning the outbound ops and the number of inbound ops dropped.
    pub fn drain(&mut self) -> (Vec<OutboundOp>, usize) {
        let outbound = std::mem::take(&mut self.outbound).into_values().collect();
        let inbound = std::mem::take(&mut self.inbound).len();
        self.pending = Pending::default();
        (outbound, inbound)
    }
}
