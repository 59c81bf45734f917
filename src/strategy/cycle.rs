use std::fmt;
use tokio::task::JoinHandle;

/// Where the detection cycle stands, derived from the cycle flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    SeedDetected,
    AwaitingDistribution,
    BuyPending,
    HoldingPosition,
    SellPending,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CyclePhase::Idle => "Idle",
            CyclePhase::SeedDetected => "SeedDetected",
            CyclePhase::AwaitingDistribution => "AwaitingDistribution",
            CyclePhase::BuyPending => "BuyPending",
            CyclePhase::HoldingPosition => "HoldingPosition",
            CyclePhase::SellPending => "SellPending",
        };
        f.write_str(name)
    }
}

/// The single in-flight detection cycle.
///
/// With no candidate token every flag is false and the counter is zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleState {
    pub candidate_token: Option<String>,
    pub seller_handoff_observed: bool,
    pub distributing_in_progress: bool,
    pub bought_confirmed: bool,
    pub received_count: u32,
    /// The sell has been handed to the execution engine
    pub sell_requested: bool,
    pub sold_confirmed: bool,
}

impl CycleState {
    pub fn phase(&self) -> CyclePhase {
        if self.candidate_token.is_none() {
            CyclePhase::Idle
        } else if !self.seller_handoff_observed {
            CyclePhase::SeedDetected
        } else if !self.distributing_in_progress {
            CyclePhase::AwaitingDistribution
        } else if !self.bought_confirmed {
            CyclePhase::BuyPending
        } else if !self.sell_requested {
            CyclePhase::HoldingPosition
        } else {
            CyclePhase::SellPending
        }
    }

    pub fn candidate(&self) -> Option<&str> {
        self.candidate_token.as_deref()
    }

    pub fn is_candidate(&self, token: &str) -> bool {
        self.candidate() == Some(token)
    }

    pub fn is_idle(&self) -> bool {
        self.candidate_token.is_none()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// No flag may be set without a candidate token
    pub fn is_consistent(&self) -> bool {
        self.candidate_token.is_some()
            || (!self.seller_handoff_observed
                && !self.distributing_in_progress
                && !self.bought_confirmed
                && self.received_count == 0
                && !self.sell_requested
                && !self.sold_confirmed)
    }
}

/// A buy waiting on its jitter timer or on execution
#[derive(Debug)]
pub struct PendingBuy {
    pub token: String,
    pub retry_count: u32,
    timer: Option<JoinHandle<()>>,
}

impl PendingBuy {
    pub fn new(token: impl Into<String>, timer: JoinHandle<()>) -> Self {
        Self {
            token: token.into(),
            retry_count: 0,
            timer: Some(timer),
        }
    }

    /// Timer has fired; the buy itself is now in flight
    pub fn fired(&mut self) {
        self.timer = None;
    }

    pub fn cancel(mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
