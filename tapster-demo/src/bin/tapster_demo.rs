use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tapster_controller::{
    controller::{ControlError, ControlHandle, DemoController},
    demo_config::{ButtonConfig, DemoConfig},
    demo_model::DemoModel,
    simulator::SimulatedCell,
    start_button::{find_button_port, open_button, ButtonListener},
    state_machine::transition_graph,
    waypoints::FileWaypointStore,
};
use tapster_demo::{launcher, logging};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version)]
struct Args {
    /// Config file, json or yaml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory with the recorded waypoint files
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Serial device of the start button, "auto" to search for it
    #[arg(long)]
    button: Option<String>,

    /// Write the transition graph in Graphviz dot format
    #[arg(long)]
    graph: Option<PathBuf>,

    /// How long every simulated motion takes
    #[arg(long, default_value_t = 200)]
    sim_motion_ms: u64,

    /// Sets the level of verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log as json lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_tracing(args.verbose, args.json_logs);

    let mut config = match &args.config {
        Some(path) => {
            DemoConfig::load(path).with_context(|| format!("failed to load config {path:?}"))?
        }
        None => DemoConfig::included(),
    };
    if let Some(data_dir) = args.data_dir {
        config.motions.data_dir = data_dir;
    }

    if let Some(path) = &args.graph {
        tokio::fs::write(path, transition_graph().to_dot())
            .await
            .with_context(|| format!("failed to write graph to {path:?}"))?;
        info!(?path, "wrote transition graph");
    }

    let waypoints = FileWaypointStore::new(&config.motions.data_dir);
    info!(data_dir = ?waypoints.data_dir(), "loading recorded motions");
    let (model, _cell) = SimulatedCell::build(
        config.clone(),
        Box::new(waypoints),
        Duration::from_millis(args.sim_motion_ms),
    );
    let (controller, handle) = DemoController::new(model);
    let mut controller_task = tokio::spawn(controller.run());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let button_task = match &args.button {
        Some(device) => start_button(device, &config.button, handle.clone(), shutdown_rx).await?,
        None => None,
    };

    info!("Press enter to pick a vessel, q to quit");
    let lines = launcher::spawn_stdin_reader();
    let launcher_result: Result<()> = tokio::select! {
        exit = launcher::run_launcher(lines, &handle) => {
            exit.map(|exit| info!(?exit, "launcher finished")).map_err(anyhow::Error::from)
        }
        signal = tokio::signal::ctrl_c() => {
            signal.map(|_| info!("Detected Ctrl+c")).context("failed to wait for Ctrl+c")
        }
        joined = &mut controller_task => {
            let _ = shutdown_tx.send(true);
            return controller_exited(joined);
        }
    };

    handle.shutdown();
    let _ = shutdown_tx.send(true);
    if let Some(task) = button_task {
        match task.await {
            Ok(Ok(presses)) => info!(presses, "start button listener stopped"),
            Ok(Err(error)) => warn!(%error, "start button listener failed"),
            Err(error) => warn!(%error, "start button listener panicked"),
        }
    }

    let model = controller_task.await.context("controller task panicked")??;
    launcher_result?;
    info!(
        remaining = model.session().remaining_vessels,
        "demo finished"
    );
    Ok(())
}

fn controller_exited(
    joined: std::result::Result<std::result::Result<DemoModel, ControlError>, tokio::task::JoinError>,
) -> Result<()> {
    joined.context("controller task panicked")??;
    bail!("controller stopped unexpectedly")
}

async fn start_button(
    device: &str,
    config: &ButtonConfig,
    handle: ControlHandle,
    shutdown: watch::Receiver<bool>,
) -> Result<Option<JoinHandle<std::io::Result<u64>>>> {
    let port = if device == "auto" {
        match find_button_port(config).await {
            Some(port) => port,
            None => {
                warn!("no start button found, continuing without it");
                return Ok(None);
            }
        }
    } else {
        PathBuf::from(device)
    };
    let reader = open_button(&port)
        .await
        .with_context(|| format!("failed to open start button {port:?}"))?;
    info!(?port, "listening for start button");
    let listener = ButtonListener::new(config);
    Ok(Some(tokio::spawn(listener.run(reader, shutdown, move || {
        handle.request_pick(false);
    }))))
}
