//! Control task of the demo.
//!
//! [`DemoController`] owns the state machine and the model and runs on a
//! single task. Trigger sources talk to it through a cloneable
//! [`ControlHandle`] and watch its progress on a status channel.

use crate::demo_model::{ActionError, DemoModel};
use crate::state_machine::{Event, EventParams, State, StateMachine, TriggerGate};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ControlError {
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error("controller is no longer running")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Homing the arms, triggers are dropped
    Starting,
    /// Waiting for a trigger
    Idle,
    Running,
    /// Rack is empty, waiting for the operator to refill it
    AwaitingConfirmation,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlStatus {
    pub phase: Phase,
    pub state: State,
    pub remaining_vessels: u32,
    pub completed_cycles: u64,
}

#[derive(Debug)]
enum Command {
    Pick(EventParams),
    ConfirmRefill,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ControlHandle {
    commands: mpsc::UnboundedSender<Command>,
    gate: Arc<TriggerGate>,
    status: watch::Receiver<ControlStatus>,
    stop: Arc<watch::Sender<bool>>,
}

impl ControlHandle {
    /// Requests a cycle. Returns false and does nothing when the demo is busy.
    pub fn request_pick(&self, operator: bool) -> bool {
        if !self.gate.try_claim() {
            debug!(operator, "trigger ignored, demo is busy");
            return false;
        }
        let params = EventParams { operator };
        if self.commands.send(Command::Pick(params)).is_err() {
            warn!("trigger dropped, controller stopped");
            return false;
        }
        true
    }

    pub fn confirm_refill(&self) -> Result<(), ControlError> {
        self.commands
            .send(Command::ConfirmRefill)
            .map_err(|_| ControlError::Stopped)
    }

    /// Stops the controller between cycles, or at the next repoll of a cycle
    /// that is waiting on a sensor
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
        // already stopped is fine
        let _ = self.commands.send(Command::Shutdown);
    }

    pub fn status(&self) -> ControlStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControlStatus> {
        self.status.clone()
    }

    /// Waits until the controller publishes `phase`
    pub async fn wait_for_phase(&self, phase: Phase) -> Result<ControlStatus, ControlError> {
        let mut status = self.status.clone();
        loop {
            let current = *status.borrow_and_update();
            if current.phase == phase {
                return Ok(current);
            }
            status.changed().await.map_err(|_| ControlError::Stopped)?;
        }
    }
}

pub struct DemoController {
    machine: StateMachine,
    model: DemoModel,
    commands: mpsc::UnboundedReceiver<Command>,
    gate: Arc<TriggerGate>,
    status: watch::Sender<ControlStatus>,
    stop: watch::Receiver<bool>,
    completed_cycles: u64,
    stopping: bool,
}

impl DemoController {
    pub fn new(model: DemoModel) -> (DemoController, ControlHandle) {
        let machine = StateMachine::new(model.config().control.repoll_interval());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(TriggerGate::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(ControlStatus {
            phase: Phase::Starting,
            state: machine.state(),
            remaining_vessels: model.session().remaining_vessels,
            completed_cycles: 0,
        });
        let controller = DemoController {
            machine,
            model,
            commands: command_rx,
            gate: gate.clone(),
            status: status_tx,
            stop: stop_rx,
            completed_cycles: 0,
            stopping: false,
        };
        let handle = ControlHandle {
            commands: command_tx,
            gate,
            status: status_rx,
            stop: Arc::new(stop_tx),
        };
        (controller, handle)
    }

    fn publish(&self, phase: Phase) {
        self.status.send_replace(ControlStatus {
            phase,
            state: self.machine.state(),
            remaining_vessels: self.model.session().remaining_vessels,
            completed_cycles: self.completed_cycles,
        });
    }

    /// Homes the arms, then serves triggers until shut down.
    ///
    /// Returns the model so callers can inspect the final session.
    pub async fn run(mut self) -> Result<DemoModel, ControlError> {
        let result = self.serve().await;
        self.gate.close();
        self.publish(Phase::Stopped);
        if let Err(error) = &result {
            error!(%error, "controller stopped on error");
        }
        result.map(|_| self.model)
    }

    async fn serve(&mut self) -> Result<(), ControlError> {
        self.publish(Phase::Starting);
        self.model.home().await?;
        while !self.stopping {
            self.publish(Phase::Idle);
            self.gate.open();
            let command = self.commands.recv().await;
            self.gate.close();
            match command {
                Some(Command::Pick(params)) => {
                    self.publish(Phase::Running);
                    self.cycle(params).await?;
                }
                Some(Command::ConfirmRefill) => debug!("no refill pending"),
                Some(Command::Shutdown) | None => self.stopping = true,
            }
        }
        info!(cycles = self.completed_cycles, "controller stopped");
        Ok(())
    }

    async fn cycle(&mut self, params: EventParams) -> Result<(), ControlError> {
        let mut event = Event::PickVessel;
        loop {
            let report = self
                .machine
                .run_until(event, params, &mut self.model, &mut self.stop)
                .await?;
            if report.entries_of(State::AwaitingPickup) > 0 && report.final_state == State::Idle {
                self.completed_cycles += 1;
                info!(
                    cycles = self.completed_cycles,
                    remaining = self.model.session().remaining_vessels,
                    "vessel delivered"
                );
            }
            if let Some(halted) = report.halted {
                info!(state = %report.final_state, %halted, "cycle halted for shutdown");
                self.stopping = true;
                return Ok(());
            }
            let Some(pending) = report.pending else {
                return Ok(());
            };
            if !self.await_confirmation().await {
                return Ok(());
            }
            event = pending;
        }
    }

    /// True once the operator confirmed, false when shutting down
    async fn await_confirmation(&mut self) -> bool {
        // confirmations sent before the rack ran empty do not count
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Shutdown = command {
                self.stopping = true;
                return false;
            }
            debug!(?command, "discarding stale command");
        }
        self.publish(Phase::AwaitingConfirmation);
        info!("Rack is empty, confirm once the vessels are refilled");
        loop {
            match self.commands.recv().await {
                Some(Command::ConfirmRefill) => return true,
                Some(Command::Pick(_)) => debug!("trigger ignored while awaiting refill"),
                Some(Command::Shutdown) | None => {
                    self.stopping = true;
                    return false;
                }
            }
        }
    }
}
