use super::table::{alternatives, available_events, Condition, Effect};
use super::{Event, State, ALL_STATES};
use std::fmt::Write;

/// Transition graph derived from the transition table.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransitionGraph {
    pub states: Vec<State>,
    pub transitions: Vec<TransitionEdge>,
}

/// Directed edge, one per alternative
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TransitionEdge {
    pub start: State,
    pub event: Event,
    pub condition: Condition,
    pub effect: Option<Effect>,
    pub goal: State,
}

impl TransitionEdge {
    fn label(&self) -> String {
        let mut label = self.event.label().to_owned();
        match self.condition {
            Condition::Always => (),
            Condition::When(guard) => {
                let _ = write!(label, " [{guard}]");
            }
            Condition::Unless(guard) => {
                let _ = write!(label, " [!{guard}]");
            }
        }
        if let Some(Effect::MeasureLoad) = self.effect {
            label.push_str(" / measure_load");
        }
        label
    }
}

pub fn transition_graph() -> TransitionGraph {
    let mut transitions = Vec::new();
    for state in ALL_STATES {
        for event in available_events(state) {
            for alternative in alternatives(state, *event) {
                transitions.push(TransitionEdge {
                    start: state,
                    event: *event,
                    condition: alternative.condition,
                    effect: alternative.effect,
                    goal: alternative.target,
                });
            }
        }
    }
    TransitionGraph {
        states: ALL_STATES.to_vec(),
        transitions,
    }
}

impl TransitionGraph {
    /// Graphviz rendering, the initial state is drawn doubled
    pub fn to_dot(&self) -> String {
        let mut dot = String::from("digraph demo_control {\n    rankdir=LR;\n");
        for state in &self.states {
            let shape = if *state == State::initial() {
                "doublecircle"
            } else {
                "circle"
            };
            let _ = writeln!(dot, "    {state} [shape={shape}];");
        }
        for edge in &self.transitions {
            let _ = writeln!(
                dot,
                "    {} -> {} [label=\"{}\"];",
                edge.start,
                edge.goal,
                edge.label()
            );
        }
        dot.push_str("}\n");
        dot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::Guard;

    #[test]
    fn graph_contains_every_alternative() {
        let graph = transition_graph();
        assert_eq!(graph.states.len(), ALL_STATES.len());

        let expected = [
            (State::Idle, Event::PickVessel, State::HoldingEmptyVessel),
            (State::Idle, Event::PickVessel, State::VesselsExhausted),
            (State::VesselsExhausted, Event::RefillVessels, State::Idle),
            (State::HoldingEmptyVessel, Event::OpenDispense, State::Dispensing),
            (State::HoldingEmptyVessel, Event::OpenDispense, State::Idle),
            (State::Dispensing, Event::CloseDispense, State::HoldingFilledVessel),
            (State::Dispensing, Event::CloseDispense, State::Dispensing),
            (State::HoldingFilledVessel, Event::PlaceVessel, State::AwaitingPickup),
            (State::AwaitingPickup, Event::ReturnToIdle, State::Idle),
            (State::AwaitingPickup, Event::ReturnToIdle, State::AwaitingPickup),
        ];
        for (start, event, goal) in expected {
            assert!(
                graph.transitions.iter().any(|edge| {
                    edge.start == start && edge.event == event && edge.goal == goal
                }),
                "missing edge {start:?} -> {event:?} -> {goal:?}"
            );
        }
        assert_eq!(graph.transitions.len(), expected.len());
    }

    #[test]
    fn dot_output_labels_guards_and_effects() {
        let dot = transition_graph().to_dot();
        assert!(dot.starts_with("digraph demo_control {"));
        assert!(dot.contains("idle [shape=doublecircle];"));
        assert!(dot.contains(
            "dispensing -> dispensing [label=\"close_dispense [!level_sufficient] / measure_load\"];"
        ));
        assert!(dot.contains(&format!(
            "idle -> holding_empty_vessel [label=\"pick_vessel [{}]\"];",
            Guard::VesselAvailable
        )));
        assert!(dot.trim_end().ends_with('}'));
    }
}
