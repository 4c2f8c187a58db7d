use super::engine::EngineError;
use super::{Event, State};
use std::fmt;

/// Read only questions deciding between alternatives
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Guard {
    VesselAvailable,
    VesselGrasped,
    LevelSufficient,
    PickedUp,
}

impl Guard {
    pub const fn label(self) -> &'static str {
        match self {
            Guard::VesselAvailable => "vessel_available",
            Guard::VesselGrasped => "vessel_grasped",
            Guard::LevelSufficient => "level_sufficient",
            Guard::PickedUp => "picked_up",
        }
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Condition {
    Always,
    When(Guard),
    Unless(Guard),
}

impl Condition {
    pub const fn guard(self) -> Option<Guard> {
        match self {
            Condition::Always => None,
            Condition::When(guard) | Condition::Unless(guard) => Some(guard),
        }
    }

    fn holds(self, guard_value: impl Fn(Guard) -> bool) -> bool {
        match self {
            Condition::Always => true,
            Condition::When(guard) => guard_value(guard),
            Condition::Unless(guard) => !guard_value(guard),
        }
    }
}

/// Effects attached to a single alternative of a transition
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    MeasureLoad,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Alternative {
    pub condition: Condition,
    pub target: State,
    pub effect: Option<Effect>,
}

impl Alternative {
    const fn new(condition: Condition, target: State, effect: Option<Effect>) -> Self {
        Alternative {
            condition,
            target,
            effect,
        }
    }
}

/// What entering a state asks for next
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Chain {
    Fire(Event),
    /// Suspend until someone outside confirms, then fire
    AfterConfirmation(Event),
}

impl Chain {
    pub const fn event(self) -> Event {
        match self {
            Chain::Fire(event) | Chain::AfterConfirmation(event) => event,
        }
    }
}

use Condition::{Always, Unless, When};
use Guard::*;

const PICK_VESSEL: [Alternative; 2] = [
    Alternative::new(When(VesselAvailable), State::HoldingEmptyVessel, None),
    Alternative::new(Unless(VesselAvailable), State::VesselsExhausted, None),
];
const REFILL_VESSELS: [Alternative; 1] = [Alternative::new(Always, State::Idle, None)];
const OPEN_DISPENSE: [Alternative; 2] = [
    Alternative::new(
        When(VesselGrasped),
        State::Dispensing,
        Some(Effect::MeasureLoad),
    ),
    Alternative::new(Unless(VesselGrasped), State::Idle, None),
];
const CLOSE_DISPENSE: [Alternative; 2] = [
    Alternative::new(When(LevelSufficient), State::HoldingFilledVessel, None),
    Alternative::new(
        Unless(LevelSufficient),
        State::Dispensing,
        Some(Effect::MeasureLoad),
    ),
];
const PLACE_VESSEL: [Alternative; 1] = [Alternative::new(Always, State::AwaitingPickup, None)];
const RETURN_TO_IDLE: [Alternative; 2] = [
    Alternative::new(When(PickedUp), State::Idle, None),
    Alternative::new(Unless(PickedUp), State::AwaitingPickup, None),
];

/// Ordered alternatives of `event` in `state`, empty when the event is not
/// accepted there
pub fn alternatives(state: State, event: Event) -> &'static [Alternative] {
    match (state, event) {
        (State::Idle, Event::PickVessel) => &PICK_VESSEL,
        (State::VesselsExhausted, Event::RefillVessels) => &REFILL_VESSELS,
        (State::HoldingEmptyVessel, Event::OpenDispense) => &OPEN_DISPENSE,
        (State::Dispensing, Event::CloseDispense) => &CLOSE_DISPENSE,
        (State::HoldingFilledVessel, Event::PlaceVessel) => &PLACE_VESSEL,
        (State::AwaitingPickup, Event::ReturnToIdle) => &RETURN_TO_IDLE,
        _ => &[],
    }
}

pub fn available_events(state: State) -> &'static [Event] {
    match state {
        State::Idle => &[Event::PickVessel],
        State::VesselsExhausted => &[Event::RefillVessels],
        State::HoldingEmptyVessel => &[Event::OpenDispense],
        State::Dispensing => &[Event::CloseDispense],
        State::HoldingFilledVessel => &[Event::PlaceVessel],
        State::AwaitingPickup => &[Event::ReturnToIdle],
    }
}

/// Entry hook of every state. Only `Idle` waits for an outside trigger.
pub fn entry_chain(state: State) -> Option<Chain> {
    match state {
        State::Idle => None,
        State::HoldingEmptyVessel => Some(Chain::Fire(Event::OpenDispense)),
        State::Dispensing => Some(Chain::Fire(Event::CloseDispense)),
        State::HoldingFilledVessel => Some(Chain::Fire(Event::PlaceVessel)),
        State::AwaitingPickup => Some(Chain::Fire(Event::ReturnToIdle)),
        State::VesselsExhausted => Some(Chain::AfterConfirmation(Event::RefillVessels)),
    }
}

/// Pure first-match selection over the table
pub fn select_transition(
    state: State,
    event: Event,
    guard_value: impl Fn(Guard) -> bool,
) -> Result<Alternative, EngineError> {
    alternatives(state, event)
        .iter()
        .find(|alternative| alternative.condition.holds(&guard_value))
        .copied()
        .ok_or(EngineError::InvalidTransition { state, event })
}
