//! Per-request lifecycle.

use crate::Error;
use std::fmt;
use tracing::{debug, warn};

/// Where a request is in its lifecycle.
///
/// `Received → Resolved → OptionsBuilt → Dispatched`, then either `Emitting* → Terminal`
/// (streaming) or `Completed`. `Error` is reachable from every non-final phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    Resolved,
    OptionsBuilt,
    Dispatched,
    Emitting,
    Terminal,
    Completed,
    Error,
}

impl RequestPhase {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            RequestPhase::Terminal | RequestPhase::Completed | RequestPhase::Error
        )
    }

    pub fn can_advance_to(self, next: RequestPhase) -> bool {
        use RequestPhase::*;
        if self.is_final() {
            return false;
        }
        matches!(
            (self, next),
            (_, Error)
                | (Received, Resolved)
                | (Resolved, OptionsBuilt)
                | (OptionsBuilt, Dispatched)
                | (Dispatched, Emitting)
                | (Dispatched, Terminal)
                | (Dispatched, Completed)
                | (Emitting, Emitting)
                | (Emitting, Terminal)
        )
    }
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracks one request's phase and logs each transition.
#[derive(Debug)]
pub struct RequestTrace {
    id: String,
    endpoint: &'static str,
    model: String,
    phase: RequestPhase,
}

impl RequestTrace {
    pub fn new(id: impl Into<String>, endpoint: &'static str, model: impl Into<String>) -> Self {
        let trace = Self {
            id: id.into(),
            endpoint,
            model: model.into(),
            phase: RequestPhase::Received,
        };
        debug!(id = %trace.id, endpoint, model = %trace.model, "request received");
        trace
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    /// Move to `next`; illegal transitions are logged and ignored.
    pub fn advance(&mut self, next: RequestPhase) -> bool {
        if !self.phase.can_advance_to(next) {
            warn!(
                id = %self.id,
                from = %self.phase,
                to = %next,
                "illegal request phase transition"
            );
            return false;
        }
        // Per-token transitions would flood the log.
        if !(self.phase == RequestPhase::Emitting && next == RequestPhase::Emitting) {
            debug!(
                id = %self.id,
                endpoint = self.endpoint,
                model = %self.model,
                phase = %next,
                "request phase"
            );
        }
        self.phase = next;
        true
    }

    pub fn fail(&mut self, error: &Error) {
        if self.advance(RequestPhase::Error) {
            warn!(
                id = %self.id,
                endpoint = self.endpoint,
                model = %self.model,
                error = %error,
                "request failed"
            );
        }
    }
}
