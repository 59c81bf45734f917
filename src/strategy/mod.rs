//! Handoff-pattern detection and the orchestrator that acts on it

pub mod cycle;
pub mod orchestrator;
pub mod state_machine;

pub use cycle::{CyclePhase, CycleState, PendingBuy};
pub use orchestrator::{EngineEvent, Orchestrator, TradePlan};
pub use state_machine::{Directive, PatternStateMachine};
