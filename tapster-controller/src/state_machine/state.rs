use std::fmt;

/// Demo states. `Idle` is the initial one, none of them is terminal.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum State {
    Idle,
    HoldingEmptyVessel,
    Dispensing,
    HoldingFilledVessel,
    VesselsExhausted,
    AwaitingPickup,
}

impl State {
    /// Compact index, stable across releases
    pub const fn id(self) -> usize {
        match self {
            State::Idle => 0,
            State::HoldingEmptyVessel => 1,
            State::Dispensing => 2,
            State::HoldingFilledVessel => 3,
            State::VesselsExhausted => 4,
            State::AwaitingPickup => 5,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::HoldingEmptyVessel => "holding_empty_vessel",
            State::Dispensing => "dispensing",
            State::HoldingFilledVessel => "holding_filled_vessel",
            State::VesselsExhausted => "vessels_exhausted",
            State::AwaitingPickup => "awaiting_pickup",
        }
    }

    pub const fn initial() -> State {
        State::Idle
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub const ALL_STATES: [State; 6] = [
    State::Idle,
    State::HoldingEmptyVessel,
    State::Dispensing,
    State::HoldingFilledVessel,
    State::VesselsExhausted,
    State::AwaitingPickup,
];
