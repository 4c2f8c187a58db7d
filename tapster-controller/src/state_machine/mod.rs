//! tapster_controller::state_machine
//!
//! Control flow of the demo as an explicit transition table.
//!
//! Key ideas:
//! - One table of (state, event) -> ordered alternatives, first match wins
//! - Guards are read only questions answered by the callbacks
//! - Auto-chaining is a post transition step of the engine loop, not a
//!   nested call from inside a callback, so the stack stays flat
//! - The refill request is a suspension point that waits for the operator

mod engine;
mod event;
mod gate;
mod graph;
mod state;
mod table;

pub use engine::{
    ChainReport, EngineError, RepeatedStep, StateMachine, Step, TransitionCallbacks,
};
pub use event::{Event, EventParams, ALL_EVENTS};
pub use gate::TriggerGate;
pub use graph::{transition_graph, TransitionEdge, TransitionGraph};
pub use state::{State, ALL_STATES};
pub use table::{
    alternatives, available_events, entry_chain, select_transition, Alternative, Chain,
    Condition, Effect, Guard,
};
