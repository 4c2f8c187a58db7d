//! Recorded waypoint files.
//!
//! A file holds comma separated rows. Rows with 7 columns are joint
//! configurations, rows with 14 columns are trajectory samples made of
//! 7 joint positions followed by 7 joint velocities. A file never mixes both.

use crate::arm_driver::{JointPositions, JointVelocities, JOINT_COUNT};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WaypointError {
    #[error("failed to read waypoint file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("waypoint file {0:?} contains no rows")]
    Empty(String),
    #[error("line {line}: {value:?} is not a number")]
    InvalidNumber { line: usize, value: String },
    #[error("line {line}: expected 7 or 14 columns, found {columns}")]
    UnsupportedColumns { line: usize, columns: usize },
    #[error("line {line}: found {columns} columns after rows of {expected}")]
    MixedColumns {
        line: usize,
        expected: usize,
        columns: usize,
    },
    #[error("unknown waypoint file {0:?}")]
    Unknown(String),
}

type Result<T> = std::result::Result<T, WaypointError>;

#[derive(Debug, Clone, PartialEq)]
pub enum Waypoint {
    Joint(JointPositions),
    Sample {
        position: JointPositions,
        velocity: JointVelocities,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaypointKind {
    Joint,
    Sample,
}

impl Waypoint {
    pub fn kind(&self) -> WaypointKind {
        match self {
            Waypoint::Joint(_) => WaypointKind::Joint,
            Waypoint::Sample { .. } => WaypointKind::Sample,
        }
    }

    /// Joint configuration of the waypoint regardless of kind
    pub fn position(&self) -> &JointPositions {
        match self {
            Waypoint::Joint(position) => position,
            Waypoint::Sample { position, .. } => position,
        }
    }
}

pub fn parse_waypoints(name: &str, text: &str) -> Result<Vec<Waypoint>> {
    let mut waypoints = Vec::new();
    let mut expected_columns = None;
    for (index, raw_line) in text.lines().enumerate() {
        let line_number = index + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let values = line
            .split(',')
            .map(|cell| {
                let cell = cell.trim();
                cell.parse::<f64>()
                    .map_err(|_| WaypointError::InvalidNumber {
                        line: line_number,
                        value: cell.to_owned(),
                    })
            })
            .collect::<Result<Vec<f64>>>()?;

        let columns = values.len();
        if columns != JOINT_COUNT && columns != 2 * JOINT_COUNT {
            return Err(WaypointError::UnsupportedColumns {
                line: line_number,
                columns,
            });
        }
        match expected_columns {
            None => expected_columns = Some(columns),
            Some(expected) if expected != columns => {
                return Err(WaypointError::MixedColumns {
                    line: line_number,
                    expected,
                    columns,
                })
            }
            Some(_) => (),
        }

        let position = JointPositions::from_row_slice(&values[..JOINT_COUNT]);
        if columns == JOINT_COUNT {
            waypoints.push(Waypoint::Joint(position));
        } else {
            waypoints.push(Waypoint::Sample {
                position,
                velocity: JointVelocities::from_row_slice(&values[JOINT_COUNT..]),
            });
        }
    }
    if waypoints.is_empty() {
        return Err(WaypointError::Empty(name.to_owned()));
    }
    Ok(waypoints)
}

/// Where named waypoint files come from
pub trait WaypointSource: Send + Sync {
    fn load(&self, name: &str) -> Result<Vec<Waypoint>>;
}

pub struct FileWaypointStore {
    data_dir: PathBuf,
}

impl FileWaypointStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        FileWaypointStore {
            data_dir: data_dir.as_ref().to_owned(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

impl WaypointSource for FileWaypointStore {
    fn load(&self, name: &str) -> Result<Vec<Waypoint>> {
        let path = self.data_dir.join(name);
        let text = fs::read_to_string(&path).map_err(|source| WaypointError::Io {
            path: path.clone(),
            source,
        })?;
        parse_waypoints(name, &text)
    }
}

#[derive(Default)]
pub struct InMemoryWaypoints {
    files: HashMap<String, Vec<Waypoint>>,
}

impl InMemoryWaypoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, waypoints: Vec<Waypoint>) {
        self.files.insert(name.into(), waypoints);
    }

    pub fn with(mut self, name: impl Into<String>, waypoints: Vec<Waypoint>) -> Self {
        self.insert(name, waypoints);
        self
    }
}

impl WaypointSource for InMemoryWaypoints {
    fn load(&self, name: &str) -> Result<Vec<Waypoint>> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| WaypointError::Unknown(name.to_owned()))
    }
}
