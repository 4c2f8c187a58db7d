use std::fmt;

/// Requests that move the demo from one state to the next
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Event {
    PickVessel,
    RefillVessels,
    OpenDispense,
    CloseDispense,
    PlaceVessel,
    ReturnToIdle,
}

impl Event {
    pub const fn label(self) -> &'static str {
        match self {
            Event::PickVessel => "pick_vessel",
            Event::RefillVessels => "refill_vessels",
            Event::OpenDispense => "open_dispense",
            Event::CloseDispense => "close_dispense",
            Event::PlaceVessel => "place_vessel",
            Event::ReturnToIdle => "return_to_idle",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub const ALL_EVENTS: [Event; 6] = [
    Event::PickVessel,
    Event::RefillVessels,
    Event::OpenDispense,
    Event::CloseDispense,
    Event::PlaceVessel,
    Event::ReturnToIdle,
];

/// Travels with an event through the whole auto-chain
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct EventParams {
    /// The operator works the dispenser by hand
    pub operator: bool,
}

impl EventParams {
    pub fn operator() -> Self {
        EventParams { operator: true }
    }

    pub fn automatic() -> Self {
        EventParams { operator: false }
    }
}
