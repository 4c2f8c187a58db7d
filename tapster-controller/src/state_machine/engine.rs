use super::table::{alternatives, entry_chain, select_transition, Chain, Effect, Guard};
use super::{available_events, Event, EventParams, State, ALL_STATES};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum EngineError {
    #[error("event {event} is not accepted in state {state}")]
    InvalidTransition { state: State, event: Event },
}

/// Hooks the engine calls while firing an event.
///
/// Order for one fire: `before_transition`, guards, state change,
/// `on_exit`, `on_event`, the effect of the selected alternative, `on_enter`.
#[async_trait]
pub trait TransitionCallbacks: Send + Sync {
    type Error: From<EngineError> + Send;

    /// Guards only read, they never command hardware
    async fn check_guard(&self, guard: Guard) -> Result<bool, Self::Error>;

    async fn before_transition(&mut self, _state: State, _event: Event, _params: EventParams) {}

    async fn on_exit(&mut self, _state: State) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Per event action, told where the machine went
    async fn on_event(
        &mut self,
        event: Event,
        target: State,
        params: EventParams,
    ) -> Result<(), Self::Error>;

    async fn apply_effect(&mut self, effect: Effect) -> Result<(), Self::Error>;

    async fn on_enter(&mut self, _state: State) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// One completed fire
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Step {
    pub event: Event,
    pub from: State,
    pub to: State,
    pub effect: Option<Effect>,
    /// What the entered state asks for next
    pub next: Option<Chain>,
}

impl Step {
    pub fn is_reentry(&self) -> bool {
        self.from == self.to
    }
}

/// A step together with how often it happened back to back
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RepeatedStep {
    pub step: Step,
    pub times: usize,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChainReport {
    pub final_state: State,
    /// Consecutive identical re-entries are folded into one entry
    pub steps: Vec<RepeatedStep>,
    entries: [usize; ALL_STATES.len()],
    /// Event waiting for outside confirmation when the chain stopped
    pub pending: Option<Event>,
    /// Event left unfired because a stop was requested while polling
    pub halted: Option<Event>,
}

impl ChainReport {
    fn new(state: State) -> Self {
        ChainReport {
            final_state: state,
            steps: Vec::new(),
            entries: [0; ALL_STATES.len()],
            pending: None,
            halted: None,
        }
    }

    fn record(&mut self, step: Step) {
        self.entries[step.to.id()] += 1;
        self.final_state = step.to;
        match self.steps.last_mut() {
            Some(last) if step.is_reentry() && last.step == step => last.times += 1,
            _ => self.steps.push(RepeatedStep { step, times: 1 }),
        }
    }

    /// How often the chain entered `state`, re-entries included
    pub fn entries_of(&self, state: State) -> usize {
        self.entries[state.id()]
    }

    /// Every entered state in order, re-entries repeated
    pub fn visited(&self) -> Vec<State> {
        self.steps
            .iter()
            .flat_map(|repeated| std::iter::repeat(repeated.step.to).take(repeated.times))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct StateMachine {
    state: State,
    repoll_interval: Duration,
}

impl StateMachine {
    pub fn new(repoll_interval: Duration) -> Self {
        Self::starting_at(State::initial(), repoll_interval)
    }

    pub fn starting_at(state: State, repoll_interval: Duration) -> Self {
        StateMachine {
            state,
            repoll_interval,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn available_events(&self) -> &'static [Event] {
        available_events(self.state)
    }

    /// Fires a single event without following the chain of the entered state.
    ///
    /// An event the current state does not accept leaves the state untouched
    /// and calls no hooks.
    pub async fn fire<C: TransitionCallbacks>(
        &mut self,
        event: Event,
        params: EventParams,
        callbacks: &mut C,
    ) -> Result<Step, C::Error> {
        let from = self.state;
        let candidates = alternatives(from, event);
        if candidates.is_empty() {
            return Err(EngineError::InvalidTransition { state: from, event }.into());
        }
        callbacks.before_transition(from, event, params).await;

        let mut guard_values: Vec<(Guard, bool)> = Vec::with_capacity(candidates.len());
        for guard in candidates.iter().filter_map(|alt| alt.condition.guard()) {
            if guard_values.iter().all(|(known, _)| *known != guard) {
                let value = callbacks.check_guard(guard).await?;
                debug!(%guard, value, "guard evaluated");
                guard_values.push((guard, value));
            }
        }
        let selected = select_transition(from, event, |guard| {
            guard_values
                .iter()
                .any(|(known, value)| *known == guard && *value)
        })?;

        self.state = selected.target;
        callbacks.on_exit(from).await?;
        callbacks.on_event(event, selected.target, params).await?;
        if let Some(effect) = selected.effect {
            callbacks.apply_effect(effect).await?;
        }
        callbacks.on_enter(selected.target).await?;

        Ok(Step {
            event,
            from,
            to: selected.target,
            effect: selected.effect,
            next: entry_chain(selected.target),
        })
    }

    /// Fires `event` and keeps following the entered states' chains until the
    /// machine waits for a trigger or for a confirmation.
    ///
    /// Self loops wait the repoll interval before firing again.
    pub async fn run<C: TransitionCallbacks>(
        &mut self,
        event: Event,
        params: EventParams,
        callbacks: &mut C,
    ) -> Result<ChainReport, C::Error> {
        self.follow_chain(event, params, callbacks, None).await
    }

    /// Like [`StateMachine::run`], but a self loop gives up once `stop` turns
    /// true. The event it would have fired is reported as `halted`.
    ///
    /// Transitions already underway always complete.
    pub async fn run_until<C: TransitionCallbacks>(
        &mut self,
        event: Event,
        params: EventParams,
        callbacks: &mut C,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<ChainReport, C::Error> {
        self.follow_chain(event, params, callbacks, Some(stop)).await
    }

    async fn follow_chain<C: TransitionCallbacks>(
        &mut self,
        event: Event,
        params: EventParams,
        callbacks: &mut C,
        mut stop: Option<&mut watch::Receiver<bool>>,
    ) -> Result<ChainReport, C::Error> {
        let mut report = ChainReport::new(self.state);
        let mut next = Some(event);
        while let Some(event) = next.take() {
            let step = self.fire(event, params, callbacks).await?;
            report.record(step);
            match step.next {
                None => (),
                Some(Chain::Fire(chained)) => {
                    if step.is_reentry() && self.repoll(stop.as_deref_mut()).await {
                        info!(state = %step.to, event = %chained, "stop requested, chain halted");
                        report.halted = Some(chained);
                    } else {
                        next = Some(chained);
                    }
                }
                Some(Chain::AfterConfirmation(chained)) => {
                    info!(state = %step.to, event = %chained, "waiting for confirmation");
                    report.pending = Some(chained);
                }
            }
        }
        Ok(report)
    }

    /// Waits out the repoll interval, true when a stop arrived meanwhile
    async fn repoll(&self, stop: Option<&mut watch::Receiver<bool>>) -> bool {
        let Some(stop) = stop else {
            tokio::time::sleep(self.repoll_interval).await;
            return false;
        };
        tokio::select! {
            _ = tokio::time::sleep(self.repoll_interval) => false,
            stopped = stop_requested(stop) => {
                if !stopped {
                    tokio::time::sleep(self.repoll_interval).await;
                }
                stopped
            }
        }
    }
}

/// True once `stop` holds true, false when nobody can send a stop anymore
async fn stop_requested(stop: &mut watch::Receiver<bool>) -> bool {
    loop {
        if *stop.borrow_and_update() {
            return true;
        }
        if stop.changed().await.is_err() {
            return false;
        }
    }
}
