//! Operator console: one line on stdin per request.

use crate::error::LauncherError;
use std::io::BufRead;
use tapster_controller::controller::{ControlHandle, Phase};
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineAction {
    Quit,
    Pick,
    ConfirmRefill,
}

/// `q` quits, anything else starts a cycle or confirms a refill
pub fn interpret(line: &str, phase: Phase) -> LineAction {
    if line.trim() == "q" {
        LineAction::Quit
    } else if phase == Phase::AwaitingConfirmation {
        LineAction::ConfirmRefill
    } else {
        LineAction::Pick
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherExit {
    Quit,
    EndOfInput,
}

/// Reads stdin on a plain thread so a pending read never holds up shutdown
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (sender, receiver) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if sender.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(error) => {
                    error!(%error, "failed to read stdin");
                    break;
                }
            }
        }
    });
    receiver
}

pub async fn run_launcher(
    mut lines: mpsc::Receiver<String>,
    handle: &ControlHandle,
) -> Result<LauncherExit, LauncherError> {
    while let Some(line) = lines.recv().await {
        match interpret(&line, handle.status().phase) {
            LineAction::Quit => return Ok(LauncherExit::Quit),
            LineAction::Pick => {
                if !handle.request_pick(true) {
                    info!("demo is busy, trigger ignored");
                }
            }
            LineAction::ConfirmRefill => {
                info!("refill confirmed");
                handle.confirm_refill()?;
            }
        }
    }
    Ok(LauncherExit::EndOfInput)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tapster_controller::controller::DemoController;
    use tapster_controller::demo_config::DemoConfig;
    use tapster_controller::simulator::{placeholder_waypoints, SimulatedCell};

    #[test]
    fn lines_map_to_actions() {
        assert_eq!(interpret("q", Phase::Idle), LineAction::Quit);
        assert_eq!(interpret(" q\n", Phase::AwaitingConfirmation), LineAction::Quit);
        assert_eq!(interpret("", Phase::Idle), LineAction::Pick);
        assert_eq!(interpret("go", Phase::Running), LineAction::Pick);
        assert_eq!(
            interpret("done", Phase::AwaitingConfirmation),
            LineAction::ConfirmRefill
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lines_drive_the_controller() {
        let mut config = DemoConfig::included();
        config.vessels.max_vessels = 1;
        let waypoints = placeholder_waypoints(&config.motions);
        let (model, _cell) =
            SimulatedCell::build(config, Box::new(waypoints), Duration::from_millis(10));
        let (controller, handle) = DemoController::new(model);
        let task = tokio::spawn(controller.run());
        handle.wait_for_phase(Phase::Idle).await.unwrap();

        let (sender, receiver) = mpsc::channel(4);
        let launcher = tokio::spawn({
            let handle = handle.clone();
            async move { run_launcher(receiver, &handle).await }
        });

        sender.send(String::new()).await.unwrap();
        handle.wait_for_phase(Phase::Running).await.unwrap();
        handle.wait_for_phase(Phase::Idle).await.unwrap();

        sender.send("again".to_owned()).await.unwrap();
        handle
            .wait_for_phase(Phase::AwaitingConfirmation)
            .await
            .unwrap();
        sender.send("refilled".to_owned()).await.unwrap();
        let status = handle.wait_for_phase(Phase::Idle).await.unwrap();
        assert_eq!(status.remaining_vessels, 1);

        sender.send("q".to_owned()).await.unwrap();
        assert_eq!(launcher.await.unwrap().unwrap(), LauncherExit::Quit);

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closed_input_ends_the_launcher() {
        let config = DemoConfig::included();
        let waypoints = placeholder_waypoints(&config.motions);
        let (model, _cell) = SimulatedCell::build(config, Box::new(waypoints), Duration::ZERO);
        let (_controller, handle) = DemoController::new(model);
        let (sender, receiver) = mpsc::channel::<String>(1);
        drop(sender);
        let exit = run_launcher(receiver, &handle).await.unwrap();
        assert_eq!(exit, LauncherExit::EndOfInput);
    }
}
