use async_trait::async_trait;
use nalgebra as na;
use std::fmt;
use thiserror::Error;

/// Number of joints on each manipulator
pub const JOINT_COUNT: usize = 7;

pub type JointPositions = na::SVector<f64, JOINT_COUNT>;
pub type JointVelocities = na::SVector<f64, JOINT_COUNT>;
/// Force (x, y, z) followed by torque (x, y, z)
pub type Wrench = na::Vector6<f64>;
pub type Pose = na::Isometry3<f64>;
pub type Impedance = na::Matrix6<f64>;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("motion fault: {reason}")]
    MotionFault {
        reason: String,
        /// last trajectory sample that was sent before the fault
        reached_index: Option<usize>,
    },
    #[error("command rejected: {0}")]
    Rejected(String),
    #[error("failed when talking to arm")]
    Communication(#[from] std::io::Error),
}

impl DriverError {
    pub fn motion_fault(reason: impl Into<String>) -> Self {
        DriverError::MotionFault {
            reason: reason.into(),
            reached_index: None,
        }
    }

    /// Transient faults (reflexes, control exceptions) are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::MotionFault { .. })
    }
}

type Result<T> = std::result::Result<T, DriverError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArmSide {
    Left,
    Right,
}

impl ArmSide {
    pub const fn label(self) -> &'static str {
        match self {
            ArmSide::Left => "left",
            ArmSide::Right => "right",
        }
    }
}

impl fmt::Display for ArmSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GripperState {
    /// finger opening in meters
    pub width: f64,
    pub is_grasped: bool,
}

impl GripperState {
    pub fn new(width: f64, is_grasped: bool) -> GripperState {
        GripperState { width, is_grasped }
    }
}

/// Timed position/velocity playback at a fixed control rate
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryRequest {
    pub positions: Vec<JointPositions>,
    pub velocities: Vec<JointVelocities>,
    /// first sample to stream, used when resuming an interrupted playback
    pub start_index: usize,
    pub control_rate_hz: f64,
}

impl TrajectoryRequest {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Playback of the samples left to stream is bounded by the control rate.
    ///
    /// Zero when the rate is not a positive number.
    pub fn max_runtime(&self) -> std::time::Duration {
        let samples = self.len().saturating_sub(self.start_index);
        std::time::Duration::try_from_secs_f64(samples as f64 / self.control_rate_hz)
            .unwrap_or_default()
    }
}

/// Motion-control interface of a single manipulator.
///
/// Implementations own the realtime loop. Every call blocks the caller
/// until the motion finished or faulted.
#[async_trait]
pub trait MotionDriver: Send + Sync {
    async fn move_to_joint_position(
        &mut self,
        configurations: &[JointPositions],
        speed_factor: f64,
    ) -> Result<()>;
    async fn move_to_pose(
        &mut self,
        poses: &[Pose],
        speed_factor: f64,
        impedance: &Impedance,
    ) -> Result<()>;
    async fn play_trajectory(&mut self, request: &TrajectoryRequest) -> Result<()>;
    /// Estimated external wrench at the end effector
    async fn read_external_wrench(&self) -> Result<Wrench>;
    fn forward_kinematics(&self, joints: &JointPositions) -> Result<Pose>;
}

#[async_trait]
pub trait GripperDriver: Send + Sync {
    async fn open(&mut self, width: f64, speed: f64) -> Result<bool>;
    async fn grasp(
        &mut self,
        width: f64,
        speed: f64,
        force: f64,
        epsilon_inner: f64,
        epsilon_outer: f64,
    ) -> Result<bool>;
    async fn read_state(&self) -> Result<GripperState>;
}

/// Tells whether a delivered vessel was taken away
#[async_trait]
pub trait PickupSensor: Send + Sync {
    async fn vessel_removed(&self) -> Result<bool>;
}

/// Used when no delivery sensor is installed
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumePickup;

#[async_trait]
impl PickupSensor for AssumePickup {
    async fn vessel_removed(&self) -> Result<bool> {
        Ok(true)
    }
}

/// One manipulator with its gripper
pub struct Arm {
    pub side: ArmSide,
    pub motion: Box<dyn MotionDriver>,
    pub gripper: Box<dyn GripperDriver>,
}

impl Arm {
    pub fn new(
        side: ArmSide,
        motion: Box<dyn MotionDriver>,
        gripper: Box<dyn GripperDriver>,
    ) -> Arm {
        Arm {
            side,
            motion,
            gripper,
        }
    }
}

pub fn impedance_from_diagonal(diagonal: [f64; 6]) -> Impedance {
    Impedance::from_diagonal(&na::Vector6::from_row_slice(&diagonal))
}
