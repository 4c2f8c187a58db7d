use std::path::PathBuf;
use std::time::Duration;
use tapster_controller::{
    arm_driver::{Arm, ArmSide, MotionDriver, Wrench},
    controller::{DemoController, Phase},
    demo_config::DemoConfig,
    demo_model::{grasp_poses, DemoModel},
    motion_executor::{DualArmTask, MotionExecutor, MotionSpec},
    simulator::{SimEvent, SimLog, SimulatedArm, SimulatedCell, SimulatedGripper},
    state_machine::{Event, EventParams, State, StateMachine},
    waypoints::{FileWaypointStore, WaypointKind, WaypointSource},
};

fn data_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("data")
}

fn recorded_cell(config: DemoConfig) -> (DemoModel, SimulatedCell) {
    SimulatedCell::build(
        config,
        Box::new(FileWaypointStore::new(data_dir())),
        Duration::from_millis(100),
    )
}

#[test]
fn shipped_motions_load() {
    let config = DemoConfig::included();
    let store = FileWaypointStore::new(data_dir());
    for name in config.motions.all_files() {
        let waypoints = store.load(name).unwrap();
        assert!(!waypoints.is_empty(), "{name}");
    }
    for name in ["open_dispenser.csv", "level_vessel.csv"] {
        let waypoints = store.load(name).unwrap();
        assert!(waypoints.iter().all(|w| w.kind() == WaypointKind::Sample));
    }
}

#[tokio::test(start_paused = true)]
async fn last_vessel_is_filled_and_delivered() {
    let (mut model, cell) = recorded_cell(DemoConfig::included());
    model.session_mut().remaining_vessels = 1;
    // bias, then a load crossing the threshold on the third sample
    cell.right.queue_wrenches([
        Wrench::new(0.0, 0.0, -9.0, 0.0, 0.0, 0.0),
        Wrench::new(0.0, 0.0, -10.0, 0.0, 0.0, 0.0),
        Wrench::new(0.0, 0.0, -11.5, 0.0, 0.0, 0.0),
        Wrench::new(0.0, 0.0, -13.0, 0.0, 0.0, 0.0),
    ]);
    model.home().await.unwrap();

    let mut machine = StateMachine::new(Duration::from_millis(20));
    let report = machine
        .run(Event::PickVessel, EventParams::operator(), &mut model)
        .await
        .unwrap();

    assert_eq!(
        report.visited(),
        vec![
            State::HoldingEmptyVessel,
            State::Dispensing,
            State::Dispensing,
            State::Dispensing,
            State::HoldingFilledVessel,
            State::AwaitingPickup,
            State::Idle,
        ]
    );
    assert_eq!(report.entries_of(State::Dispensing), 3);
    assert_eq!(model.session().remaining_vessels, 0);

    // the last vessel sits in the bottom right slot of the rack
    let pose_moves = cell
        .log
        .events()
        .into_iter()
        .filter_map(|event| match event {
            SimEvent::PoseMove { poses, .. } => Some(poses),
            _ => None,
        })
        .collect::<Vec<_>>();
    let store = FileWaypointStore::new(data_dir());
    let reference_joints = *store.load("grasp_vessel.csv").unwrap()[0].position();
    let reference = SimulatedArm::new(ArmSide::Right, SimLog::new())
        .forward_kinematics(&reference_joints)
        .unwrap();
    let expected = grasp_poses(&reference, 12, &DemoConfig::included().vessels);
    assert_eq!(
        pose_moves,
        vec![
            vec![expected.pre_grasp, expected.grasp],
            vec![expected.post_grasp]
        ]
    );

    let next = machine
        .run(Event::PickVessel, EventParams::operator(), &mut model)
        .await
        .unwrap();
    assert_eq!(next.final_state, State::VesselsExhausted);
    assert_eq!(next.pending, Some(Event::RefillVessels));
}

#[tokio::test(start_paused = true)]
async fn failing_arm_does_not_hold_up_the_other() {
    let config = DemoConfig::included();
    let store = FileWaypointStore::new(data_dir());
    let log = SimLog::new();
    let arm = |side: ArmSide| {
        let motion =
            SimulatedArm::new(side, log.clone()).with_motion_delay(Duration::from_millis(100));
        let handle = motion.handle();
        let arm = Arm::new(
            side,
            Box::new(motion),
            Box::new(SimulatedGripper::new(side, log.clone())),
        );
        (arm, handle)
    };
    let (mut left, left_handle) = arm(ArmSide::Left);
    let (mut right, _) = arm(ArmSide::Right);
    left_handle.fail_always(true);

    let spec = |names: &[String]| {
        MotionSpec::from_sources(&store, names, config.motion.speed_factor, config.motion.retries)
            .unwrap()
    };
    let task = DualArmTask::new(
        spec(&config.motions.left_idle),
        spec(&config.motions.right_idle),
    );

    let started = tokio::time::Instant::now();
    let outcome = MotionExecutor::new(&config.motion)
        .execute_dual(&mut left, &mut right, &task)
        .await;

    assert_eq!(outcome.as_pair(), (false, true));
    assert_eq!(outcome.left.attempts, 4);
    assert_eq!(outcome.right.attempts, 1);
    // both arms started together, the join waits for the slower one
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(400));
    assert!(elapsed < Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn operator_refills_an_empty_rack() {
    let mut config = DemoConfig::included();
    config.vessels.max_vessels = 1;
    let (model, _cell) = recorded_cell(config);
    let (controller, handle) = DemoController::new(model);
    let task = tokio::spawn(controller.run());

    handle.wait_for_phase(Phase::Idle).await.unwrap();
    assert!(handle.request_pick(true));
    handle.wait_for_phase(Phase::Running).await.unwrap();
    handle.wait_for_phase(Phase::Idle).await.unwrap();

    assert!(handle.request_pick(false));
    let status = handle
        .wait_for_phase(Phase::AwaitingConfirmation)
        .await
        .unwrap();
    assert_eq!(status.remaining_vessels, 0);

    handle.confirm_refill().unwrap();
    let status = handle.wait_for_phase(Phase::Idle).await.unwrap();
    assert_eq!(status.remaining_vessels, 1);
    assert_eq!(status.completed_cycles, 1);

    handle.shutdown();
    let model = task.await.unwrap().unwrap();
    assert_eq!(model.session().remaining_vessels, 1);
}
