use tapster_controller::controller::ControlError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("failed to reach the controller")]
    Control(#[from] ControlError),
}
