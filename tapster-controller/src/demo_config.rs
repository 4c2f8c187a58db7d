use crate::arm_driver::{impedance_from_diagonal, Impedance};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, str, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error while accessing configuration")]
    IoError(#[from] std::io::Error),
    #[error("error while parsing json")]
    JsonError(#[from] serde_json::Error),
    #[error("error while parsing yaml")]
    YamlError(#[from] serde_yaml::Error),
    #[error("unsupported configuration format {0:?}")]
    UnsupportedFormat(PathBuf),
    #[error("invalid configuration value for {field}")]
    InvalidValue { field: &'static str },
}

type Result<T> = std::result::Result<T, ConfigError>;

lazy_static! {
    static ref INCLUDED: DemoConfig = {
        let json = include_str!("../config/tapster.json");
        DemoConfig::parse_json(json).expect("included configuration is valid")
    };
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct VesselRackConfig {
    pub max_vessels: u32,
    pub slots_per_row: u32,
    /// spacing between slots along X in meters
    pub slot_pitch_x: f64,
    /// spacing between rows along Z in meters
    pub slot_pitch_z: f64,
    pub approach_height: f64,
    pub retreat_distance: f64,
}

impl Default for VesselRackConfig {
    fn default() -> Self {
        VesselRackConfig {
            max_vessels: 12,
            slots_per_row: 3,
            slot_pitch_x: 0.15,
            slot_pitch_z: 0.1,
            approach_height: 0.15,
            retreat_distance: 0.15,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MotionConfig {
    pub speed_factor: f64,
    /// used to reach the first sample of a trajectory
    pub trajectory_speed_factor: f64,
    pub retries: u32,
    pub control_rate_hz: f64,
    pub impedance: [f64; 6],
    /// abort the current action when a scripted motion runs out of retries
    pub abort_on_failure: bool,
}

impl Default for MotionConfig {
    fn default() -> Self {
        MotionConfig {
            speed_factor: 0.2,
            trajectory_speed_factor: 0.05,
            retries: 3,
            control_rate_hz: 1000.0,
            impedance: [600.0, 600.0, 600.0, 30.0, 30.0, 30.0],
            abort_on_failure: false,
        }
    }
}

impl MotionConfig {
    pub fn impedance_matrix(&self) -> Impedance {
        impedance_from_diagonal(self.impedance)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GripperConfig {
    pub release_width: f64,
    pub speed: f64,
    pub grasp_width: f64,
    pub grasp_force: f64,
    pub epsilon_inner: f64,
    pub epsilon_outer: f64,
    /// narrower than this means the fingers closed on nothing
    pub min_grasp_width: f64,
}

impl Default for GripperConfig {
    fn default() -> Self {
        GripperConfig {
            release_width: 0.08,
            speed: 0.05,
            grasp_width: 0.0,
            grasp_force: 20.0,
            epsilon_inner: 0.08,
            epsilon_outer: 0.08,
            min_grasp_width: 0.05,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SensingConfig {
    pub settle_delay_ms: u64,
    /// force deviation in newtons that counts as filled
    pub level_threshold: f64,
}

impl Default for SensingConfig {
    fn default() -> Self {
        SensingConfig {
            settle_delay_ms: 20,
            level_threshold: 3.5,
        }
    }
}

impl SensingConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    /// pause before a state re-polls its own guard
    pub repoll_interval_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            repoll_interval_ms: 20,
        }
    }
}

impl ControlConfig {
    pub fn repoll_interval(&self) -> Duration {
        Duration::from_millis(self.repoll_interval_ms)
    }
}

/// Waypoint files for every scripted motion
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MotionFiles {
    pub data_dir: PathBuf,
    pub left_idle: Vec<String>,
    pub right_idle: Vec<String>,
    /// joint configuration of the first rack slot grasp
    pub grasp_reference: String,
    pub pre_grasp_dispenser: Vec<String>,
    pub grasp_dispenser: Vec<String>,
    pub open_dispenser: Vec<String>,
    pub move_vessel_to_dispenser: Vec<String>,
    pub level_vessel: Vec<String>,
    pub place_vessel: Vec<String>,
    pub post_place_vessel: Vec<String>,
}

impl Default for MotionFiles {
    fn default() -> Self {
        fn files(names: &[&str]) -> Vec<String> {
            names.iter().map(|name| name.to_string()).collect()
        }
        MotionFiles {
            data_dir: PathBuf::from("data"),
            left_idle: files(&["left_idle.csv"]),
            right_idle: files(&["right_idle.csv"]),
            grasp_reference: "grasp_vessel.csv".to_owned(),
            pre_grasp_dispenser: files(&["pre_grasp_dispenser.csv"]),
            grasp_dispenser: files(&["grasp_dispenser.csv"]),
            open_dispenser: files(&["open_dispenser.csv"]),
            move_vessel_to_dispenser: files(&["move_vessel_to_dispenser.csv"]),
            level_vessel: files(&["level_vessel.csv"]),
            place_vessel: files(&["place_vessel.csv"]),
            post_place_vessel: files(&["post_place_vessel.csv"]),
        }
    }
}

impl MotionFiles {
    /// Every file name the scripted motions refer to, without duplicates
    pub fn all_files(&self) -> Vec<&str> {
        let lists = [
            &self.left_idle,
            &self.right_idle,
            &self.pre_grasp_dispenser,
            &self.grasp_dispenser,
            &self.open_dispenser,
            &self.move_vessel_to_dispenser,
            &self.level_vessel,
            &self.place_vessel,
            &self.post_place_vessel,
        ];
        let mut names: Vec<&str> = vec![self.grasp_reference.as_str()];
        for name in lists.into_iter().flatten() {
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }
        names
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ButtonConfig {
    pub poll_interval_ms: u64,
    pub port_pattern: String,
    pub identifier: String,
}

impl Default for ButtonConfig {
    fn default() -> Self {
        ButtonConfig {
            poll_interval_ms: 10,
            port_pattern: "ttyACM".to_owned(),
            identifier: "id=start_button".to_owned(),
        }
    }
}

impl ButtonConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct DemoConfig {
    pub vessels: VesselRackConfig,
    pub motion: MotionConfig,
    pub gripper: GripperConfig,
    pub sensing: SensingConfig,
    pub control: ControlConfig,
    pub motions: MotionFiles,
    pub button: ButtonConfig,
}

impl DemoConfig {
    /// Tapster comes with an included config file.
    ///
    /// This file is packaged with the binary
    /// This method retrieves this included version
    pub fn included() -> DemoConfig {
        INCLUDED.clone()
    }

    pub fn parse_json(text: &str) -> Result<DemoConfig> {
        let config: DemoConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse_yaml(text: &str) -> Result<DemoConfig> {
        let config: DemoConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let rate = self.motion.control_rate_hz;
        if !(rate.is_finite() && rate > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "motion.control_rate_hz",
            });
        }
        Ok(())
    }

    pub fn serialize_to_json(&self) -> Result<String> {
        let json = serde_json::to_string_pretty(self)?;
        Ok(json)
    }

    pub fn serialize_to_yaml(&self) -> Result<String> {
        let yaml = serde_yaml::to_string(self)?;
        Ok(yaml)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.serialize_to_json()?)?;
        Ok(())
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<DemoConfig> {
        let text = fs::read_to_string(path)?;
        DemoConfig::parse_json(&text)
    }

    pub fn load_yaml(path: impl AsRef<Path>) -> Result<DemoConfig> {
        let text = fs::read_to_string(path)?;
        DemoConfig::parse_yaml(&text)
    }

    /// Picks the parser from the file extension
    pub fn load(path: impl AsRef<Path>) -> Result<DemoConfig> {
        let path = path.as_ref();
        match path.extension().and_then(|extension| extension.to_str()) {
            Some("json") => DemoConfig::load_json(path),
            Some("yaml") | Some("yml") => DemoConfig::load_yaml(path),
            _ => Err(ConfigError::UnsupportedFormat(path.to_owned())),
        }
    }
}
