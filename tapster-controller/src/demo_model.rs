//! Binds the demo transitions to arm motions.
//!
//! [`DemoModel`] answers the guards from the sensor gate and runs the
//! scripted motions of every event through the motion executor. It owns the
//! session and is only ever driven from the control task.

use crate::arm_driver::{
    Arm, AssumePickup, DriverError, JointPositions, PickupSensor, Pose, Wrench,
};
use crate::demo_config::{DemoConfig, VesselRackConfig};
use crate::motion_executor::{
    self, DualArmTask, DualOutcome, GripperError, MotionExecutor, MotionOutcome, MotionSpec,
};
use crate::sensor_gate::SensorGate;
use crate::state_machine::{
    Effect, EngineError, Event, EventParams, Guard, State, TransitionCallbacks,
};
use crate::waypoints::{WaypointError, WaypointSource};
use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ActionError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Gripper(#[from] GripperError),
    #[error("driver error during {operation}")]
    Driver {
        operation: &'static str,
        #[source]
        source: DriverError,
    },
    #[error(transparent)]
    Waypoint(#[from] WaypointError),
    #[error("{operation} ran out of retries")]
    MotionFailed { operation: &'static str },
}

impl ActionError {
    fn driver(operation: &'static str) -> impl FnOnce(DriverError) -> ActionError {
        move |source| ActionError::Driver { operation, source }
    }
}

/// Mutable state of one demo run
#[derive(Debug, Clone, PartialEq)]
pub struct DemoSession {
    pub remaining_vessels: u32,
    /// Wrench with the empty vessel held still, taken once per cycle
    pub force_bias: Wrench,
    pub last_load: Wrench,
}

impl DemoSession {
    pub fn new(max_vessels: u32) -> Self {
        DemoSession {
            remaining_vessels: max_vessels,
            force_bias: Wrench::zeros(),
            last_load: Wrench::zeros(),
        }
    }

    /// Takes the next vessel off the rack and returns its 1 based slot
    fn take_vessel(&mut self, max_vessels: u32) -> u32 {
        self.remaining_vessels = self.remaining_vessels.saturating_sub(1);
        max_vessels - self.remaining_vessels.min(max_vessels)
    }
}

/// Cartesian targets for taking a vessel out of the rack
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraspPoses {
    pub pre_grasp: Pose,
    pub grasp: Pose,
    pub post_grasp: Pose,
}

/// World frame offset of rack slot `slot` from the first slot
pub fn slot_offset(slot: u32, rack: &VesselRackConfig) -> (f64, f64) {
    let index = slot.saturating_sub(1);
    let per_row = rack.slots_per_row.max(1);
    let dx = (index % per_row) as f64 * rack.slot_pitch_x;
    let dz = -((index / per_row) as f64) * rack.slot_pitch_z;
    (dx, dz)
}

pub fn grasp_poses(reference: &Pose, slot: u32, rack: &VesselRackConfig) -> GraspPoses {
    let (dx, dz) = slot_offset(slot, rack);
    let shifted = |x: f64, y: f64, z: f64| {
        let mut pose = *reference;
        pose.translation.vector.x += x;
        pose.translation.vector.y += y;
        pose.translation.vector.z += z;
        pose
    };
    GraspPoses {
        pre_grasp: shifted(dx, 0.0, dz + rack.approach_height),
        grasp: shifted(dx, 0.0, dz),
        post_grasp: shifted(dx, rack.retreat_distance, dz),
    }
}

pub struct DemoModel {
    left: Arm,
    right: Arm,
    executor: MotionExecutor,
    gate: SensorGate,
    config: DemoConfig,
    waypoints: Box<dyn WaypointSource>,
    pickup: Box<dyn PickupSensor>,
    session: DemoSession,
}

impl DemoModel {
    /// `right` handles the vessels, `left` the dispenser
    pub fn new(
        config: DemoConfig,
        left: Arm,
        right: Arm,
        waypoints: Box<dyn WaypointSource>,
    ) -> Self {
        DemoModel {
            left,
            right,
            executor: MotionExecutor::new(&config.motion),
            gate: SensorGate::new(&config),
            session: DemoSession::new(config.vessels.max_vessels),
            config,
            waypoints,
            pickup: Box::new(AssumePickup),
        }
    }

    pub fn with_pickup_sensor(mut self, pickup: Box<dyn PickupSensor>) -> Self {
        self.pickup = pickup;
        self
    }

    pub fn session(&self) -> &DemoSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut DemoSession {
        &mut self.session
    }

    pub fn config(&self) -> &DemoConfig {
        &self.config
    }

    /// Moves both arms to their idle poses
    pub async fn home(&mut self) -> Result<(), ActionError> {
        info!("moving arms to idle poses");
        let task = self.dual_task(
            &self.config.motions.left_idle,
            &self.config.motions.right_idle,
        )?;
        let outcome = self
            .executor
            .execute_dual(&mut self.left, &mut self.right, &task)
            .await;
        self.consult_dual("home", outcome)
    }

    fn spec(&self, names: &[String]) -> Result<MotionSpec, WaypointError> {
        MotionSpec::from_sources(
            self.waypoints.as_ref(),
            names,
            self.config.motion.speed_factor,
            self.config.motion.retries,
        )
    }

    fn dual_task(&self, left: &[String], right: &[String]) -> Result<DualArmTask, WaypointError> {
        Ok(DualArmTask::new(self.spec(left)?, self.spec(right)?))
    }

    fn consult(&self, operation: &'static str, outcome: MotionOutcome) -> Result<(), ActionError> {
        if outcome.succeeded() {
            return Ok(());
        }
        if self.config.motion.abort_on_failure {
            return Err(ActionError::MotionFailed { operation });
        }
        warn!(
            operation,
            failed_runs = outcome.failed_runs,
            "motion incomplete, continuing"
        );
        Ok(())
    }

    fn consult_dual(
        &self,
        operation: &'static str,
        outcome: DualOutcome,
    ) -> Result<(), ActionError> {
        self.consult(operation, outcome.left)?;
        self.consult(operation, outcome.right)
    }

    async fn run_left(
        &mut self,
        operation: &'static str,
        names: &[String],
    ) -> Result<(), ActionError> {
        let spec = self.spec(names)?;
        let outcome = self.executor.execute(&mut self.left, &spec).await;
        self.consult(operation, outcome)
    }

    async fn run_right(
        &mut self,
        operation: &'static str,
        names: &[String],
    ) -> Result<(), ActionError> {
        let spec = self.spec(names)?;
        let outcome = self.executor.execute(&mut self.right, &spec).await;
        self.consult(operation, outcome)
    }

    async fn run_dual(
        &mut self,
        operation: &'static str,
        left: &[String],
        right: &[String],
    ) -> Result<(), ActionError> {
        let task = self.dual_task(left, right)?;
        let outcome = self
            .executor
            .execute_dual(&mut self.left, &mut self.right, &task)
            .await;
        self.consult_dual(operation, outcome)
    }

    fn reference_grasp_pose(&self) -> Result<Pose, ActionError> {
        let name = &self.config.motions.grasp_reference;
        let joints: JointPositions = *self
            .waypoints
            .load(name)?
            .first()
            .ok_or_else(|| WaypointError::Empty(name.clone()))?
            .position();
        self.right
            .motion
            .forward_kinematics(&joints)
            .map_err(ActionError::driver("forward_kinematics"))
    }

    async fn pick_vessel(&mut self, params: EventParams) -> Result<(), ActionError> {
        let max_vessels = self.config.vessels.max_vessels;
        let slot = self.session.take_vessel(max_vessels);
        info!(
            slot,
            remaining = self.session.remaining_vessels,
            "Picking up vessel"
        );

        let poses = grasp_poses(&self.reference_grasp_pose()?, slot, &self.config.vessels);
        let speed = self.config.motion.speed_factor;
        let retries = self.config.motion.retries;
        let outcome = self
            .executor
            .move_to_pose(&mut self.right, &[poses.pre_grasp, poses.grasp], speed, retries)
            .await;
        self.consult("approach_vessel", outcome)?;
        motion_executor::grasp(&mut self.right, &self.config.gripper).await?;
        let outcome = self
            .executor
            .move_to_pose(&mut self.right, &[poses.post_grasp], speed, retries)
            .await;
        self.consult("lift_vessel", outcome)?;

        let motions = self.config.motions.clone();
        if params.operator {
            self.run_right("move_vessel_to_dispenser", &motions.move_vessel_to_dispenser)
                .await?;
        } else {
            let left = [motions.pre_grasp_dispenser, motions.grasp_dispenser].concat();
            self.run_dual(
                "move_vessel_to_dispenser",
                &left,
                &motions.move_vessel_to_dispenser,
            )
            .await?;
        }

        self.session.force_bias = self
            .gate
            .capture_bias(&self.right)
            .await
            .map_err(ActionError::driver("capture_bias"))?;
        Ok(())
    }

    async fn open_dispense(
        &mut self,
        target: State,
        params: EventParams,
    ) -> Result<(), ActionError> {
        let motions = self.config.motions.clone();
        if target == State::Dispensing {
            if !params.operator {
                motion_executor::grasp(&mut self.left, &self.config.gripper).await?;
                self.run_left("open_dispenser", &motions.open_dispenser).await?;
            }
            return Ok(());
        }
        warn!("vessel not grasped, returning to idle");
        let right = [motions.post_place_vessel, motions.right_idle].concat();
        self.run_dual("abandon_vessel", &motions.left_idle, &right).await
    }

    async fn close_dispense(
        &mut self,
        target: State,
        params: EventParams,
    ) -> Result<(), ActionError> {
        if target != State::HoldingFilledVessel {
            return Ok(());
        }
        let motions = self.config.motions.clone();
        if params.operator {
            return self.run_right("level_vessel", &motions.level_vessel).await;
        }
        self.run_dual(
            "close_dispenser",
            &motions.grasp_dispenser,
            &motions.level_vessel,
        )
        .await?;
        motion_executor::release(&mut self.left, &self.config.gripper).await?;
        self.run_left("leave_dispenser", &motions.pre_grasp_dispenser)
            .await
    }

    async fn place_vessel(&mut self) -> Result<(), ActionError> {
        let motions = self.config.motions.clone();
        self.run_right("place_vessel", &motions.place_vessel).await?;
        motion_executor::release(&mut self.right, &self.config.gripper).await?;
        self.run_right("post_place_vessel", &motions.post_place_vessel)
            .await
    }

    async fn return_to_idle(&mut self, target: State) -> Result<(), ActionError> {
        if target != State::Idle {
            return Ok(());
        }
        let motions = self.config.motions.clone();
        self.run_dual("return_to_idle", &motions.left_idle, &motions.right_idle)
            .await
    }

    fn refill_vessels(&mut self) {
        self.session.remaining_vessels = self.config.vessels.max_vessels;
        info!(remaining = self.session.remaining_vessels, "vessels refilled");
    }
}

#[async_trait]
impl TransitionCallbacks for DemoModel {
    type Error = ActionError;

    async fn check_guard(&self, guard: Guard) -> Result<bool, ActionError> {
        match guard {
            Guard::VesselAvailable => {
                info!("{} vessels remaining", self.session.remaining_vessels);
                Ok(self.session.remaining_vessels >= 1)
            }
            Guard::VesselGrasped => {
                let state = self
                    .gate
                    .read_gripper(&self.right)
                    .await
                    .map_err(ActionError::driver("read_gripper"))?;
                Ok(self.gate.vessel_grasped(&state))
            }
            Guard::LevelSufficient => Ok(self
                .gate
                .level_sufficient(&self.session.last_load, &self.session.force_bias)),
            Guard::PickedUp => {
                info!("Checking if user picked up vessel");
                self.pickup
                    .vessel_removed()
                    .await
                    .map_err(ActionError::driver("vessel_removed"))
            }
        }
    }

    async fn before_transition(&mut self, state: State, event: Event, params: EventParams) {
        info!(%state, operator = params.operator, "Action \"{}\" triggered", event);
    }

    async fn on_event(
        &mut self,
        event: Event,
        target: State,
        params: EventParams,
    ) -> Result<(), ActionError> {
        match event {
            Event::PickVessel if target == State::VesselsExhausted => {
                warn!("no vessels left in the rack");
                Ok(())
            }
            Event::PickVessel => self.pick_vessel(params).await,
            Event::RefillVessels => {
                self.refill_vessels();
                Ok(())
            }
            Event::OpenDispense => self.open_dispense(target, params).await,
            Event::CloseDispense => self.close_dispense(target, params).await,
            Event::PlaceVessel => self.place_vessel().await,
            Event::ReturnToIdle => self.return_to_idle(target).await,
        }
    }

    async fn apply_effect(&mut self, effect: Effect) -> Result<(), ActionError> {
        match effect {
            Effect::MeasureLoad => {
                self.session.last_load = self
                    .gate
                    .measure_load(&self.right)
                    .await
                    .map_err(ActionError::driver("measure_load"))?;
                Ok(())
            }
        }
    }

    async fn on_enter(&mut self, state: State) -> Result<(), ActionError> {
        info!("Entered state \"{}\"", state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm_driver::ArmSide;
    use crate::simulator::{placeholder_waypoints, SimEvent, SimulatedCell};
    use crate::state_machine::StateMachine;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use std::time::Duration;

    fn rig(config: DemoConfig) -> (DemoModel, SimulatedCell) {
        let waypoints = placeholder_waypoints(&config.motions);
        SimulatedCell::build(config, Box::new(waypoints), Duration::ZERO)
    }

    fn machine() -> StateMachine {
        StateMachine::new(DemoConfig::default().control.repoll_interval())
    }

    #[test]
    fn slot_offsets_follow_rack_layout() {
        let rack = VesselRackConfig::default();
        let expected = [
            (1, 0.0, 0.0),
            (2, 0.15, 0.0),
            (3, 0.3, 0.0),
            (4, 0.0, -0.1),
            (12, 0.3, -0.3),
        ];
        for (slot, dx, dz) in expected {
            let (x, z) = slot_offset(slot, &rack);
            assert_relative_eq!(x, dx, epsilon = 1e-12);
            assert_relative_eq!(z, dz, epsilon = 1e-12);
        }
    }

    #[test]
    fn grasp_poses_shift_reference() {
        let rack = VesselRackConfig::default();
        let reference = Pose::translation(0.5, 0.0, 0.2);
        let poses = grasp_poses(&reference, 5, &rack);

        assert_relative_eq!(
            poses.grasp.translation.vector,
            Vector3::new(0.65, 0.0, 0.1),
            epsilon = 1e-12
        );
        assert_relative_eq!(
            poses.pre_grasp.translation.vector,
            Vector3::new(0.65, 0.0, 0.25),
            epsilon = 1e-12
        );
        assert_relative_eq!(
            poses.post_grasp.translation.vector,
            Vector3::new(0.65, 0.15, 0.1),
            epsilon = 1e-12
        );
    }

    #[test]
    fn taking_vessels_never_underflows() {
        let mut session = DemoSession::new(2);
        assert_eq!(session.take_vessel(2), 1);
        assert_eq!(session.take_vessel(2), 2);
        assert_eq!(session.take_vessel(2), 2);
        assert_eq!(session.remaining_vessels, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn operator_cycle_delivers_one_vessel() {
        let (mut model, cell) = rig(DemoConfig::default());
        model.session_mut().remaining_vessels = 1;
        cell.right.queue_wrenches([
            Wrench::zeros(),
            Wrench::new(0.0, 0.0, -1.0, 0.0, 0.0, 0.0),
            Wrench::new(0.0, 0.0, -2.0, 0.0, 0.0, 0.0),
            Wrench::new(0.0, 0.0, -4.0, 0.0, 0.0, 0.0),
        ]);

        let mut machine = machine();
        let report = machine
            .run(Event::PickVessel, EventParams::operator(), &mut model)
            .await
            .unwrap();

        assert_eq!(report.final_state, State::Idle);
        assert_eq!(report.entries_of(State::Dispensing), 3);
        assert_eq!(model.session().remaining_vessels, 0);
        assert_relative_eq!(model.session().last_load[2], -4.0);
        // operator works the dispenser, the left arm only goes home
        let left_motions = cell
            .log
            .count(|event| event.side() == ArmSide::Left && event.is_motion());
        assert_eq!(left_motions, 1);
        // bias read plus three measurements
        assert_eq!(
            cell.log
                .count(|event| matches!(event, SimEvent::WrenchRead { .. })),
            4
        );
    }

    #[tokio::test(start_paused = true)]
    async fn button_cycle_works_the_dispenser() {
        let (mut model, cell) = rig(DemoConfig::default());
        cell.right.queue_wrenches([
            Wrench::zeros(),
            Wrench::new(0.0, 0.0, -5.0, 0.0, 0.0, 0.0),
        ]);

        let mut machine = machine();
        let report = machine
            .run(Event::PickVessel, EventParams::automatic(), &mut model)
            .await
            .unwrap();

        assert_eq!(report.final_state, State::Idle);
        assert_eq!(model.session().remaining_vessels, 11);
        let left_grasps = cell.log.count(|event| {
            matches!(
                event,
                SimEvent::GripperGrasp {
                    side: ArmSide::Left,
                    ok: true
                }
            )
        });
        assert_eq!(left_grasps, 1);
        assert!(cell.log.count(|event| event.side() == ArmSide::Left && event.is_motion()) > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_rack_waits_for_refill() {
        let (mut model, cell) = rig(DemoConfig::default());
        model.session_mut().remaining_vessels = 0;

        let mut machine = machine();
        let report = machine
            .run(Event::PickVessel, EventParams::operator(), &mut model)
            .await
            .unwrap();
        assert_eq!(report.final_state, State::VesselsExhausted);
        assert_eq!(report.pending, Some(Event::RefillVessels));
        assert_eq!(cell.log.motions(), 0);

        let report = machine
            .run(Event::RefillVessels, EventParams::operator(), &mut model)
            .await
            .unwrap();
        assert_eq!(report.final_state, State::Idle);
        assert_eq!(model.session().remaining_vessels, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn missed_grasp_abandons_the_cycle() {
        let (mut model, cell) = rig(DemoConfig::default());
        cell.right_gripper.set_object_width(None);
        model.session_mut().remaining_vessels = 1;

        let mut machine = machine();
        let report = machine
            .run(Event::PickVessel, EventParams::operator(), &mut model)
            .await
            .unwrap();
        assert_eq!(
            report.visited(),
            vec![State::HoldingEmptyVessel, State::Idle]
        );
        assert_eq!(model.session().remaining_vessels, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_for_pickup_commands_nothing() {
        let (mut model, cell) = rig(DemoConfig::default());
        cell.pickup.set(false);
        let mut machine = StateMachine::starting_at(State::AwaitingPickup, Default::default());
        for _ in 0..3 {
            let step = machine
                .fire(Event::ReturnToIdle, EventParams::default(), &mut model)
                .await
                .unwrap();
            assert_eq!(step.to, State::AwaitingPickup);
        }
        assert_eq!(cell.log.motions(), 0);

        cell.pickup.set(true);
        let step = machine
            .fire(Event::ReturnToIdle, EventParams::default(), &mut model)
            .await
            .unwrap();
        assert_eq!(step.to, State::Idle);
        assert_eq!(cell.log.motions(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_continue_by_default() {
        let (mut model, cell) = rig(DemoConfig::default());
        cell.left.fail_always(true);
        model.home().await.unwrap();
        // four attempts on the left, one on the right
        assert_eq!(cell.log.motions(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_abort_when_configured() {
        let mut config = DemoConfig::default();
        config.motion.abort_on_failure = true;
        let (mut model, cell) = rig(config);
        cell.left.fail_always(true);
        let error = model.home().await.unwrap_err();
        assert!(matches!(
            error,
            ActionError::MotionFailed { operation: "home" }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn gripper_fault_is_fatal() {
        let (mut model, cell) = rig(DemoConfig::default());
        cell.right_gripper.fail_next();
        let mut machine = machine();
        let error = machine
            .run(Event::PickVessel, EventParams::operator(), &mut model)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            ActionError::Gripper(GripperError::GraspFailed(ArmSide::Right))
        ));
    }
}
