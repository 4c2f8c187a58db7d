//! In-process stand-ins for the arms, grippers and the delivery sensor.
//!
//! Every simulated device writes what it was asked to do into a shared
//! [`SimLog`]. Faults and sensor readings are scripted through handles that
//! stay usable after the device itself was boxed and handed to the model.

use crate::arm_driver::{
    ArmSide, DriverError, GripperDriver, GripperState, Impedance, JointPositions,
    JointVelocities, MotionDriver, PickupSensor, Pose, TrajectoryRequest, Wrench,
};
use crate::arm_driver::Arm;
use crate::demo_config::{DemoConfig, MotionFiles};
use crate::demo_model::DemoModel;
use crate::waypoints::{InMemoryWaypoints, Waypoint, WaypointSource};
use async_trait::async_trait;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

type Result<T> = std::result::Result<T, DriverError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    JointMove {
        side: ArmSide,
        waypoints: usize,
        failed: bool,
    },
    PoseMove {
        side: ArmSide,
        poses: Vec<Pose>,
        failed: bool,
    },
    Trajectory {
        side: ArmSide,
        start_index: usize,
        samples: usize,
        failed: bool,
    },
    WrenchRead {
        side: ArmSide,
    },
    GripperOpen {
        side: ArmSide,
        ok: bool,
    },
    GripperGrasp {
        side: ArmSide,
        ok: bool,
    },
}

impl SimEvent {
    pub fn side(&self) -> ArmSide {
        match self {
            SimEvent::JointMove { side, .. }
            | SimEvent::PoseMove { side, .. }
            | SimEvent::Trajectory { side, .. }
            | SimEvent::WrenchRead { side }
            | SimEvent::GripperOpen { side, .. }
            | SimEvent::GripperGrasp { side, .. } => *side,
        }
    }

    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            SimEvent::JointMove { .. } | SimEvent::PoseMove { .. } | SimEvent::Trajectory { .. }
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimLog {
    events: Arc<Mutex<Vec<SimEvent>>>,
}

impl SimLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, event: SimEvent) {
        lock(&self.events).push(event);
    }

    pub fn events(&self) -> Vec<SimEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self, predicate: impl Fn(&SimEvent) -> bool) -> usize {
        lock(&self.events).iter().filter(|event| predicate(*event)).count()
    }

    pub fn motions(&self) -> usize {
        self.count(SimEvent::is_motion)
    }
}

#[derive(Debug)]
struct ArmScript {
    pending_faults: u32,
    pending_trajectory_faults: u32,
    always_fail: bool,
    wrenches: VecDeque<Wrench>,
    last_wrench: Wrench,
    /// added to every reading that has no queued value
    fill_step: Wrench,
}

impl ArmScript {
    fn take_fault(&mut self) -> bool {
        if self.always_fail {
            return true;
        }
        if self.pending_faults > 0 {
            self.pending_faults -= 1;
            return true;
        }
        false
    }

    fn take_trajectory_fault(&mut self) -> bool {
        if self.take_fault() {
            return true;
        }
        if self.pending_trajectory_faults > 0 {
            self.pending_trajectory_faults -= 1;
            return true;
        }
        false
    }
}

/// Scripting handle for a [`SimulatedArm`]
#[derive(Debug, Clone)]
pub struct SimArmHandle {
    script: Arc<Mutex<ArmScript>>,
}

impl SimArmHandle {
    /// The next `count` motion commands fault with a transient error
    pub fn fail_next_motions(&self, count: u32) {
        lock(&self.script).pending_faults += count;
    }

    /// Only trajectory playbacks fault, approach moves still pass
    pub fn fail_next_trajectories(&self, count: u32) {
        lock(&self.script).pending_trajectory_faults += count;
    }

    pub fn fail_always(&self, enabled: bool) {
        lock(&self.script).always_fail = enabled;
    }

    /// Readings are consumed in order, the last one keeps being reported
    pub fn queue_wrenches(&self, wrenches: impl IntoIterator<Item = Wrench>) {
        lock(&self.script).wrenches.extend(wrenches);
    }

    pub fn set_wrench(&self, wrench: Wrench) {
        let mut script = lock(&self.script);
        script.wrenches.clear();
        script.last_wrench = wrench;
    }

    /// The held load grows by `step` with every reading past the queue,
    /// the way a vessel under the dispenser gets heavier
    pub fn fill_per_read(&self, step: Wrench) {
        lock(&self.script).fill_step = step;
    }

    /// Drops the held load, queued readings stay
    pub fn unload(&self) {
        lock(&self.script).last_wrench = Wrench::zeros();
    }
}

pub struct SimulatedArm {
    side: ArmSide,
    log: SimLog,
    script: Arc<Mutex<ArmScript>>,
    motion_delay: Duration,
}

impl SimulatedArm {
    pub fn new(side: ArmSide, log: SimLog) -> Self {
        SimulatedArm {
            side,
            log,
            script: Arc::new(Mutex::new(ArmScript {
                pending_faults: 0,
                pending_trajectory_faults: 0,
                always_fail: false,
                wrenches: VecDeque::new(),
                last_wrench: Wrench::zeros(),
                fill_step: Wrench::zeros(),
            })),
            motion_delay: Duration::ZERO,
        }
    }

    /// Every motion command takes this long
    pub fn with_motion_delay(mut self, delay: Duration) -> Self {
        self.motion_delay = delay;
        self
    }

    pub fn handle(&self) -> SimArmHandle {
        SimArmHandle {
            script: Arc::clone(&self.script),
        }
    }

    async fn travel(&self) {
        if !self.motion_delay.is_zero() {
            tokio::time::sleep(self.motion_delay).await;
        }
    }

    fn take_fault(&self) -> bool {
        lock(&self.script).take_fault()
    }
}

#[async_trait]
impl MotionDriver for SimulatedArm {
    async fn move_to_joint_position(
        &mut self,
        configurations: &[JointPositions],
        _speed_factor: f64,
    ) -> Result<()> {
        self.travel().await;
        let failed = self.take_fault();
        self.log.record(SimEvent::JointMove {
            side: self.side,
            waypoints: configurations.len(),
            failed,
        });
        if failed {
            return Err(DriverError::motion_fault("simulated joint motion reflex"));
        }
        Ok(())
    }

    async fn move_to_pose(
        &mut self,
        poses: &[Pose],
        _speed_factor: f64,
        _impedance: &Impedance,
    ) -> Result<()> {
        self.travel().await;
        let failed = self.take_fault();
        self.log.record(SimEvent::PoseMove {
            side: self.side,
            poses: poses.to_vec(),
            failed,
        });
        if failed {
            return Err(DriverError::motion_fault("simulated cartesian reflex"));
        }
        Ok(())
    }

    async fn play_trajectory(&mut self, request: &TrajectoryRequest) -> Result<()> {
        let failed = lock(&self.script).take_trajectory_fault();
        let runtime = request.max_runtime();
        tokio::time::sleep(if failed { runtime / 2 } else { runtime }).await;
        self.log.record(SimEvent::Trajectory {
            side: self.side,
            start_index: request.start_index,
            samples: request.len(),
            failed,
        });
        if failed {
            // interrupted halfway through the remaining samples
            let remaining = request.len().saturating_sub(request.start_index);
            return Err(DriverError::MotionFault {
                reason: "simulated trajectory interruption".to_owned(),
                reached_index: Some(request.start_index + remaining / 2),
            });
        }
        Ok(())
    }

    async fn read_external_wrench(&self) -> Result<Wrench> {
        self.log.record(SimEvent::WrenchRead { side: self.side });
        let mut script = lock(&self.script);
        match script.wrenches.pop_front() {
            Some(wrench) => script.last_wrench = wrench,
            None => {
                let step = script.fill_step;
                script.last_wrench += step;
            }
        }
        Ok(script.last_wrench)
    }

    /// Coarse stand-in for the real kinematics, only meant to give
    /// distinct poses for distinct configurations.
    fn forward_kinematics(&self, joints: &JointPositions) -> Result<Pose> {
        Ok(Pose::translation(
            0.4 + 0.1 * joints[0],
            0.1 * joints[1],
            0.3 + 0.1 * joints[2],
        ))
    }
}

#[derive(Debug)]
struct GripperScript {
    state: GripperState,
    /// width of the object between the fingers, if any
    object_width: Option<f64>,
    pending_faults: u32,
}

#[derive(Debug, Clone)]
pub struct SimGripperHandle {
    script: Arc<Mutex<GripperScript>>,
}

impl SimGripperHandle {
    /// The next gripper command reports a hardware failure
    pub fn fail_next(&self) {
        lock(&self.script).pending_faults += 1;
    }

    pub fn set_object_width(&self, width: Option<f64>) {
        lock(&self.script).object_width = width;
    }

    pub fn state(&self) -> GripperState {
        lock(&self.script).state
    }
}

pub struct SimulatedGripper {
    side: ArmSide,
    log: SimLog,
    script: Arc<Mutex<GripperScript>>,
    /// arm whose load is dropped when the fingers open
    carrier: Option<SimArmHandle>,
}

impl SimulatedGripper {
    /// Starts open with a vessel sized object within reach
    pub fn new(side: ArmSide, log: SimLog) -> Self {
        SimulatedGripper {
            side,
            log,
            script: Arc::new(Mutex::new(GripperScript {
                state: GripperState::new(0.08, false),
                object_width: Some(0.07),
                pending_faults: 0,
            })),
            carrier: None,
        }
    }

    /// Opening the fingers releases whatever `arm` carries
    pub fn carried_by(mut self, arm: SimArmHandle) -> Self {
        self.carrier = Some(arm);
        self
    }

    pub fn handle(&self) -> SimGripperHandle {
        SimGripperHandle {
            script: Arc::clone(&self.script),
        }
    }
}

#[async_trait]
impl GripperDriver for SimulatedGripper {
    async fn open(&mut self, width: f64, _speed: f64) -> Result<bool> {
        let mut script = lock(&self.script);
        let ok = if script.pending_faults > 0 {
            script.pending_faults -= 1;
            false
        } else {
            script.state = GripperState::new(width, false);
            true
        };
        drop(script);
        if ok {
            if let Some(carrier) = &self.carrier {
                carrier.unload();
            }
        }
        self.log.record(SimEvent::GripperOpen { side: self.side, ok });
        Ok(ok)
    }

    async fn grasp(
        &mut self,
        width: f64,
        _speed: f64,
        _force: f64,
        _epsilon_inner: f64,
        _epsilon_outer: f64,
    ) -> Result<bool> {
        let mut script = lock(&self.script);
        let ok = if script.pending_faults > 0 {
            script.pending_faults -= 1;
            false
        } else {
            // closing on air still counts as a grasp within the epsilons,
            // only the width tells the difference
            let closed_width = script.object_width.unwrap_or(width);
            script.state = GripperState::new(closed_width, true);
            true
        };
        self.log.record(SimEvent::GripperGrasp { side: self.side, ok });
        Ok(ok)
    }

    async fn read_state(&self) -> Result<GripperState> {
        Ok(lock(&self.script).state)
    }
}

/// Delivery sensor replaying scripted answers, the last one repeats
#[derive(Debug, Clone)]
pub struct ScriptedPickup {
    answers: Arc<Mutex<VecDeque<bool>>>,
    last: Arc<Mutex<bool>>,
    checks: Arc<Mutex<usize>>,
}

impl ScriptedPickup {
    pub fn new(removed: bool) -> Self {
        ScriptedPickup {
            answers: Arc::new(Mutex::new(VecDeque::new())),
            last: Arc::new(Mutex::new(removed)),
            checks: Arc::new(Mutex::new(0)),
        }
    }

    /// How often the sensor was asked
    pub fn checks(&self) -> usize {
        *lock(&self.checks)
    }

    pub fn queue(&self, answers: impl IntoIterator<Item = bool>) {
        lock(&self.answers).extend(answers);
    }

    pub fn set(&self, removed: bool) {
        lock(&self.answers).clear();
        *lock(&self.last) = removed;
    }
}

#[async_trait]
impl PickupSensor for ScriptedPickup {
    async fn vessel_removed(&self) -> Result<bool> {
        *lock(&self.checks) += 1;
        let mut last = lock(&self.last);
        if let Some(answer) = lock(&self.answers).pop_front() {
            *last = answer;
        }
        Ok(*last)
    }
}

/// Scripting handles of a fully simulated two arm cell
#[derive(Clone)]
pub struct SimulatedCell {
    pub log: SimLog,
    pub left: SimArmHandle,
    pub right: SimArmHandle,
    pub left_gripper: SimGripperHandle,
    pub right_gripper: SimGripperHandle,
    pub pickup: ScriptedPickup,
}

impl SimulatedCell {
    /// Builds a model whose devices are all simulated.
    ///
    /// The right arm feels the vessel fill up while it is held, so the
    /// dispensing loop ends on its own.
    pub fn build(
        config: DemoConfig,
        waypoints: Box<dyn WaypointSource>,
        motion_delay: Duration,
    ) -> (DemoModel, SimulatedCell) {
        let log = SimLog::new();
        let left_motion =
            SimulatedArm::new(ArmSide::Left, log.clone()).with_motion_delay(motion_delay);
        let right_motion =
            SimulatedArm::new(ArmSide::Right, log.clone()).with_motion_delay(motion_delay);
        let left_gripper = SimulatedGripper::new(ArmSide::Left, log.clone());
        let right_gripper =
            SimulatedGripper::new(ArmSide::Right, log.clone()).carried_by(right_motion.handle());
        // the level crosses the threshold on the third measurement
        let fill = config.sensing.level_threshold / 2.5;
        right_motion
            .handle()
            .fill_per_read(Wrench::new(0.0, 0.0, -fill, 0.0, 0.0, 0.0));
        let pickup = ScriptedPickup::new(true);
        let cell = SimulatedCell {
            log,
            left: left_motion.handle(),
            right: right_motion.handle(),
            left_gripper: left_gripper.handle(),
            right_gripper: right_gripper.handle(),
            pickup: pickup.clone(),
        };
        let left = Arm::new(ArmSide::Left, Box::new(left_motion), Box::new(left_gripper));
        let right = Arm::new(ArmSide::Right, Box::new(right_motion), Box::new(right_gripper));
        let model =
            DemoModel::new(config, left, right, waypoints).with_pickup_sensor(Box::new(pickup));
        (model, cell)
    }
}

/// Waypoints for every configured motion file, so the simulated demo runs
/// without recorded data. The dispenser and leveling motions are short
/// trajectories, everything else is a single joint configuration.
pub fn placeholder_waypoints(files: &MotionFiles) -> InMemoryWaypoints {
    let is_trajectory = |name: &str| {
        files
            .open_dispenser
            .iter()
            .chain(&files.level_vessel)
            .any(|file| file == name)
    };
    let mut store = InMemoryWaypoints::new();
    for (index, name) in files.all_files().into_iter().enumerate() {
        let base = JointPositions::from_element(0.05 * index as f64);
        let waypoints = if is_trajectory(name) {
            (0..10)
                .map(|step| Waypoint::Sample {
                    position: base.add_scalar(0.01 * step as f64),
                    velocity: JointVelocities::from_element(0.01),
                })
                .collect()
        } else {
            vec![Waypoint::Joint(base)]
        };
        store.insert(name, waypoints);
    }
    store
}
