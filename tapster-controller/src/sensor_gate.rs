//! Sensor readings behind the transition guards.
//!
//! The predicates here only read. Sampling the load is the one operation
//! that produces a new value and it is only called from transition effects.

use crate::arm_driver::{Arm, DriverError, GripperState, Wrench};
use crate::demo_config::DemoConfig;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct SensorGate {
    min_grasp_width: f64,
    level_threshold: f64,
    settle_delay: Duration,
}

impl SensorGate {
    pub fn new(config: &DemoConfig) -> Self {
        SensorGate {
            min_grasp_width: config.gripper.min_grasp_width,
            level_threshold: config.sensing.level_threshold,
            settle_delay: config.sensing.settle_delay(),
        }
    }

    /// Fingers report a grasp and did not close on air
    pub fn vessel_grasped(&self, state: &GripperState) -> bool {
        state.width > self.min_grasp_width && state.is_grasped
    }

    pub fn level_sufficient(&self, load: &Wrench, bias: &Wrench) -> bool {
        let deviation = force_deviation(load, bias);
        debug!(deviation, threshold = self.level_threshold, "checking fill level");
        deviation > self.level_threshold
    }

    pub async fn read_gripper(&self, arm: &Arm) -> Result<GripperState, DriverError> {
        arm.gripper.read_state().await
    }

    /// Waits for the arm to settle, then samples the external wrench
    pub async fn measure_load(&self, arm: &Arm) -> Result<Wrench, DriverError> {
        tokio::time::sleep(self.settle_delay).await;
        arm.motion.read_external_wrench().await
    }

    /// Baseline is taken right away, the arm is already holding still
    pub async fn capture_bias(&self, arm: &Arm) -> Result<Wrench, DriverError> {
        arm.motion.read_external_wrench().await
    }
}

/// Magnitude of the force part of `load - bias`, torques are ignored
pub fn force_deviation(load: &Wrench, bias: &Wrench) -> f64 {
    (load - bias).fixed_rows::<3>(0).norm()
}
