//! Dispatches recorded motions to the arms with a bounded retry policy.
//!
//! A [`MotionSpec`] is split into runs of one waypoint kind. Joint runs go
//! out as one joint position move, sample runs are streamed as a timed
//! trajectory. Transient faults retry the same run until the retry credits
//! are used up, after which the run counts as failed and the next run is
//! still attempted.

use crate::arm_driver::{
    Arm, ArmSide, DriverError, Impedance, JointPositions, JointVelocities, Pose,
    TrajectoryRequest,
};
use crate::demo_config::{GripperConfig, MotionConfig};
use crate::waypoints::{Waypoint, WaypointError, WaypointKind, WaypointSource};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct MotionSpec {
    pub waypoints: Vec<Waypoint>,
    pub speed_factor: f64,
    pub retries: u32,
}

impl MotionSpec {
    pub fn new(waypoints: Vec<Waypoint>, speed_factor: f64, retries: u32) -> Self {
        MotionSpec {
            waypoints,
            speed_factor: speed_factor.clamp(f64::EPSILON, 1.0),
            retries,
        }
    }

    /// Concatenates the named waypoint files in order
    pub fn from_sources(
        source: &dyn WaypointSource,
        names: &[String],
        speed_factor: f64,
        retries: u32,
    ) -> Result<Self, WaypointError> {
        let mut waypoints = Vec::new();
        for name in names {
            waypoints.extend(source.load(name)?);
        }
        Ok(MotionSpec::new(waypoints, speed_factor, retries))
    }

    /// Maximal runs of waypoints of the same kind, in order
    pub fn runs(&self) -> Vec<MotionRun> {
        let mut runs: Vec<MotionRun> = Vec::new();
        for waypoint in &self.waypoints {
            let extends_last = runs
                .last()
                .map(|run| run.kind() == waypoint.kind())
                .unwrap_or(false);
            if !extends_last {
                runs.push(match waypoint.kind() {
                    WaypointKind::Joint => MotionRun::Joint(Vec::new()),
                    WaypointKind::Sample => MotionRun::Trajectory {
                        positions: Vec::new(),
                        velocities: Vec::new(),
                    },
                });
            }
            if let Some(run) = runs.last_mut() {
                run.push(waypoint);
            }
        }
        runs
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MotionRun {
    Joint(Vec<JointPositions>),
    Trajectory {
        positions: Vec<JointPositions>,
        velocities: Vec<JointVelocities>,
    },
}

impl MotionRun {
    pub fn kind(&self) -> WaypointKind {
        match self {
            MotionRun::Joint(_) => WaypointKind::Joint,
            MotionRun::Trajectory { .. } => WaypointKind::Sample,
        }
    }

    fn len(&self) -> usize {
        match self {
            MotionRun::Joint(configurations) => configurations.len(),
            MotionRun::Trajectory { positions, .. } => positions.len(),
        }
    }

    fn push(&mut self, waypoint: &Waypoint) {
        match (self, waypoint) {
            (MotionRun::Joint(configurations), Waypoint::Joint(position)) => {
                configurations.push(*position)
            }
            (
                MotionRun::Trajectory {
                    positions,
                    velocities,
                },
                Waypoint::Sample { position, velocity },
            ) => {
                positions.push(*position);
                velocities.push(*velocity);
            }
            // runs() only pushes matching kinds
            _ => (),
        }
    }
}

/// Both arms move at the same time, each with its own spec
#[derive(Debug, Clone, PartialEq)]
pub struct DualArmTask {
    pub left: MotionSpec,
    pub right: MotionSpec,
}

impl DualArmTask {
    pub fn new(left: MotionSpec, right: MotionSpec) -> Self {
        DualArmTask { left, right }
    }
}

#[must_use = "a failed motion leaves the arm somewhere unexpected"]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MotionOutcome {
    pub runs: usize,
    pub failed_runs: usize,
    /// collaborator calls made, retries included
    pub attempts: u32,
}

impl MotionOutcome {
    pub fn succeeded(&self) -> bool {
        self.failed_runs == 0
    }

    fn add_run(&mut self, succeeded: bool, attempts: u32) {
        self.runs += 1;
        self.attempts += attempts;
        if !succeeded {
            self.failed_runs += 1;
        }
    }
}

#[must_use = "each arm reports its own outcome"]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DualOutcome {
    pub left: MotionOutcome,
    pub right: MotionOutcome,
}

impl DualOutcome {
    pub fn as_pair(&self) -> (bool, bool) {
        (self.left.succeeded(), self.right.succeeded())
    }

    pub fn succeeded(&self) -> bool {
        self.left.succeeded() && self.right.succeeded()
    }
}

#[derive(Error, Debug)]
pub enum GripperError {
    #[error("opening {0} gripper failed")]
    OpenFailed(ArmSide),
    #[error("grasping with {0} gripper failed")]
    GraspFailed(ArmSide),
    #[error("{side} gripper driver error")]
    Driver {
        side: ArmSide,
        #[source]
        source: DriverError,
    },
}

/// Logs a failed attempt and tells whether another one is allowed
fn should_retry(side: ArmSide, operation: &str, error: &DriverError, credits: u32) -> bool {
    if !error.is_transient() {
        error!(arm = %side, operation, %error, "motion failed with non transient fault");
        return false;
    }
    if credits == 0 {
        error!(arm = %side, operation, %error, "Maximum retries reached for {}", operation);
        return false;
    }
    warn!(arm = %side, operation, retries_left = credits, %error, "motion fault, retrying");
    true
}

#[derive(Debug, Clone)]
pub struct MotionExecutor {
    trajectory_speed_factor: f64,
    control_rate_hz: f64,
    impedance: Impedance,
}

impl MotionExecutor {
    pub fn new(config: &MotionConfig) -> Self {
        MotionExecutor {
            trajectory_speed_factor: config.trajectory_speed_factor,
            control_rate_hz: config.control_rate_hz,
            impedance: config.impedance_matrix(),
        }
    }

    /// Runs every run of the spec on one arm.
    ///
    /// A failed run does not stop the following ones.
    pub async fn execute(&self, arm: &mut Arm, spec: &MotionSpec) -> MotionOutcome {
        let mut outcome = MotionOutcome::default();
        for run in spec.runs() {
            debug!(arm = %arm.side, kind = ?run.kind(), waypoints = run.len(), "starting run");
            let (succeeded, attempts) = match run {
                MotionRun::Joint(configurations) => {
                    self.run_joint(arm, &configurations, spec.speed_factor, spec.retries)
                        .await
                }
                MotionRun::Trajectory {
                    positions,
                    velocities,
                } => {
                    let request = TrajectoryRequest {
                        positions,
                        velocities,
                        start_index: 0,
                        control_rate_hz: self.control_rate_hz,
                    };
                    self.run_trajectory(arm, request, spec.retries).await
                }
            };
            outcome.add_run(succeeded, attempts);
        }
        debug!(
            arm = %arm.side,
            runs = outcome.runs,
            failed_runs = outcome.failed_runs,
            attempts = outcome.attempts,
            "motion finished"
        );
        outcome
    }

    /// Moves both arms concurrently and waits for both.
    ///
    /// Neither arm is stopped when the other one fails.
    pub async fn execute_dual(
        &self,
        left: &mut Arm,
        right: &mut Arm,
        task: &DualArmTask,
    ) -> DualOutcome {
        let (left_outcome, right_outcome) =
            tokio::join!(self.execute(left, &task.left), self.execute(right, &task.right));
        DualOutcome {
            left: left_outcome,
            right: right_outcome,
        }
    }

    /// Cartesian move through `poses` under impedance control
    pub async fn move_to_pose(
        &self,
        arm: &mut Arm,
        poses: &[Pose],
        speed_factor: f64,
        retries: u32,
    ) -> MotionOutcome {
        let mut credits = retries;
        let mut attempts = 0;
        let succeeded = loop {
            attempts += 1;
            match arm
                .motion
                .move_to_pose(poses, speed_factor, &self.impedance)
                .await
            {
                Ok(()) => break true,
                Err(error) => {
                    if !should_retry(arm.side, "move_to_pose", &error, credits) {
                        break false;
                    }
                    credits -= 1;
                }
            }
        };
        let mut outcome = MotionOutcome::default();
        outcome.add_run(succeeded, attempts);
        outcome
    }

    async fn run_joint(
        &self,
        arm: &mut Arm,
        configurations: &[JointPositions],
        speed_factor: f64,
        retries: u32,
    ) -> (bool, u32) {
        let mut credits = retries;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match arm
                .motion
                .move_to_joint_position(configurations, speed_factor)
                .await
            {
                Ok(()) => return (true, attempts),
                Err(error) => {
                    if !should_retry(arm.side, "move_to_joint_position", &error, credits) {
                        return (false, attempts);
                    }
                    credits -= 1;
                }
            }
        }
    }

    async fn run_trajectory(
        &self,
        arm: &mut Arm,
        mut request: TrajectoryRequest,
        retries: u32,
    ) -> (bool, u32) {
        if request.is_empty() {
            return (true, 0);
        }
        let mut credits = retries;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let start = request.start_index;
            let result = match arm
                .motion
                .move_to_joint_position(
                    &request.positions[start..=start],
                    self.trajectory_speed_factor,
                )
                .await
            {
                Ok(()) => arm.motion.play_trajectory(&request).await,
                Err(error) => Err(error),
            };
            match result {
                Ok(()) => return (true, attempts),
                Err(error) => {
                    if !should_retry(arm.side, "play_trajectory", &error, credits) {
                        return (false, attempts);
                    }
                    credits -= 1;
                    if let DriverError::MotionFault {
                        reached_index: Some(index),
                        ..
                    } = error
                    {
                        // resume where the playback stopped
                        request.start_index = index.min(request.len() - 1);
                    }
                }
            }
        }
    }
}

/// Opens the fingers. Hardware failures are not retried.
pub async fn release(arm: &mut Arm, config: &GripperConfig) -> Result<(), GripperError> {
    let side = arm.side;
    let opened = arm
        .gripper
        .open(config.release_width, config.speed)
        .await
        .map_err(|source| GripperError::Driver { side, source })?;
    if !opened {
        error!(arm = %side, operation = "release", "Opening gripper failed");
        return Err(GripperError::OpenFailed(side));
    }
    Ok(())
}

/// Closes the fingers on an object. Hardware failures are not retried.
pub async fn grasp(arm: &mut Arm, config: &GripperConfig) -> Result<(), GripperError> {
    let side = arm.side;
    let grasped = arm
        .gripper
        .grasp(
            config.grasp_width,
            config.speed,
            config.grasp_force,
            config.epsilon_inner,
            config.epsilon_outer,
        )
        .await
        .map_err(|source| GripperError::Driver { side, source })?;
    if !grasped {
        error!(arm = %side, operation = "grasp", "Grasping failed");
        return Err(GripperError::GraspFailed(side));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm_driver::{MotionDriver, Wrench};
    use crate::simulator::{SimArmHandle, SimEvent, SimLog, SimulatedArm, SimulatedGripper};
    use async_trait::async_trait;
    use std::time::Duration;

    fn joint(value: f64) -> Waypoint {
        Waypoint::Joint(JointPositions::repeat(value))
    }

    fn sample(value: f64) -> Waypoint {
        Waypoint::Sample {
            position: JointPositions::repeat(value),
            velocity: JointVelocities::repeat(0.01),
        }
    }

    fn sim_arm(side: ArmSide, log: &SimLog) -> (Arm, SimArmHandle) {
        let motion = SimulatedArm::new(side, log.clone());
        let handle = motion.handle();
        let gripper = SimulatedGripper::new(side, log.clone());
        (Arm::new(side, Box::new(motion), Box::new(gripper)), handle)
    }

    fn executor() -> MotionExecutor {
        MotionExecutor::new(&MotionConfig::default())
    }

    #[test]
    fn runs_split_on_kind_changes() {
        let spec = MotionSpec::new(
            vec![joint(0.0), joint(0.1), sample(0.2), sample(0.3), joint(0.4)],
            0.2,
            3,
        );
        let runs = spec.runs();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].kind(), WaypointKind::Joint);
        assert_eq!(runs[0].len(), 2);
        assert_eq!(runs[1].kind(), WaypointKind::Sample);
        assert_eq!(runs[1].len(), 2);
        assert_eq!(runs[2].len(), 1);
    }

    #[test]
    fn speed_factor_is_clamped() {
        let spec = MotionSpec::new(vec![], 3.0, 0);
        assert_eq!(spec.speed_factor, 1.0);
        assert!(spec.runs().is_empty());
    }

    #[tokio::test]
    async fn transient_fault_is_retried() {
        let log = SimLog::new();
        let (mut arm, handle) = sim_arm(ArmSide::Left, &log);
        handle.fail_next_motions(2);
        let spec = MotionSpec::new(vec![joint(0.0)], 0.2, 3);
        let outcome = executor().execute(&mut arm, &spec).await;
        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn exhausted_retries_report_failure() {
        let log = SimLog::new();
        let (mut arm, handle) = sim_arm(ArmSide::Left, &log);
        handle.fail_always(true);
        let spec = MotionSpec::new(vec![joint(0.0)], 0.2, 3);
        let outcome = executor().execute(&mut arm, &spec).await;
        assert!(!outcome.succeeded());
        // one attempt plus three retries
        assert_eq!(outcome.attempts, 4);
        assert_eq!(log.motions(), 4);
    }

    #[tokio::test]
    async fn failed_run_does_not_skip_later_runs() {
        let log = SimLog::new();
        let (mut arm, handle) = sim_arm(ArmSide::Right, &log);
        handle.fail_always(true);
        let spec = MotionSpec::new(vec![joint(0.0), sample(0.1), joint(0.2)], 0.2, 0);
        let outcome = executor().execute(&mut arm, &spec).await;
        assert_eq!(outcome.runs, 3);
        assert_eq!(outcome.failed_runs, 3);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn interrupted_trajectory_resumes_from_reached_sample() {
        let log = SimLog::new();
        let (mut arm, handle) = sim_arm(ArmSide::Left, &log);
        handle.fail_next_trajectories(1);
        let samples: Vec<Waypoint> = (0..10).map(|i| sample(i as f64 * 0.01)).collect();
        let spec = MotionSpec::new(samples, 0.2, 3);
        let outcome = executor().execute(&mut arm, &spec).await;
        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts, 2);
        let starts: Vec<usize> = log
            .events()
            .iter()
            .filter_map(|event| match event {
                SimEvent::Trajectory { start_index, .. } => Some(*start_index),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec![0, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn dual_motion_reports_each_arm() {
        let log = SimLog::new();
        let (left_motion, left_handle) = {
            let motion = SimulatedArm::new(ArmSide::Left, log.clone())
                .with_motion_delay(Duration::from_millis(100));
            let handle = motion.handle();
            (motion, handle)
        };
        let mut left = Arm::new(
            ArmSide::Left,
            Box::new(left_motion),
            Box::new(SimulatedGripper::new(ArmSide::Left, log.clone())),
        );
        let (mut right, _) = sim_arm(ArmSide::Right, &log);
        left_handle.fail_always(true);

        let task = DualArmTask::new(
            MotionSpec::new(vec![joint(0.0), sample(0.1)], 0.2, 2),
            MotionSpec::new(vec![joint(0.0), sample(0.1)], 0.2, 2),
        );
        let outcome = tokio::time::timeout(
            Duration::from_secs(60),
            executor().execute_dual(&mut left, &mut right, &task),
        )
        .await
        .expect("dual motion finished");

        assert_eq!(outcome.as_pair(), (false, true));
        assert_eq!(outcome.left.runs, 2);
        assert_eq!(outcome.right.runs, 2);
        let right_motions =
            log.count(|event| event.is_motion() && event.side() == ArmSide::Right);
        // joint run plus approach move and playback of the trajectory run
        assert_eq!(right_motions, 3);
    }

    struct RejectingArm {
        calls: u32,
    }

    #[async_trait]
    impl MotionDriver for RejectingArm {
        async fn move_to_joint_position(
            &mut self,
            _configurations: &[JointPositions],
            _speed_factor: f64,
        ) -> Result<(), DriverError> {
            self.calls += 1;
            Err(DriverError::Rejected("joint limits".to_owned()))
        }

        async fn move_to_pose(
            &mut self,
            _poses: &[Pose],
            _speed_factor: f64,
            _impedance: &Impedance,
        ) -> Result<(), DriverError> {
            self.calls += 1;
            Err(DriverError::Rejected("unreachable".to_owned()))
        }

        async fn play_trajectory(&mut self, _request: &TrajectoryRequest) -> Result<(), DriverError> {
            self.calls += 1;
            Err(DriverError::Rejected("not ready".to_owned()))
        }

        async fn read_external_wrench(&self) -> Result<Wrench, DriverError> {
            Ok(Wrench::zeros())
        }

        fn forward_kinematics(&self, _joints: &JointPositions) -> Result<Pose, DriverError> {
            Ok(Pose::identity())
        }
    }

    #[tokio::test]
    async fn rejected_commands_are_not_retried() {
        let log = SimLog::new();
        let mut arm = Arm::new(
            ArmSide::Left,
            Box::new(RejectingArm { calls: 0 }),
            Box::new(SimulatedGripper::new(ArmSide::Left, log)),
        );
        let outcome = executor()
            .move_to_pose(&mut arm, &[Pose::identity()], 0.2, 3)
            .await;
        assert!(!outcome.succeeded());
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn gripper_failure_is_fatal() {
        let log = SimLog::new();
        let gripper = SimulatedGripper::new(ArmSide::Right, log.clone());
        let gripper_handle = gripper.handle();
        let mut arm = Arm::new(
            ArmSide::Right,
            Box::new(SimulatedArm::new(ArmSide::Right, log.clone())),
            Box::new(gripper),
        );
        gripper_handle.fail_next();
        let config = GripperConfig::default();
        assert!(matches!(
            grasp(&mut arm, &config).await,
            Err(GripperError::GraspFailed(ArmSide::Right))
        ));
        assert!(release(&mut arm, &config).await.is_ok());
        assert_eq!(
            log.count(|event| matches!(event, SimEvent::GripperGrasp { .. })),
            1
        );
    }
}
