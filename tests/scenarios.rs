//! End-to-end runs of a session: hallway completion, fall timeout with a
//! viewer that owns physics, and a rejected second registration.

use mazerig::{
    config::{ExperimentConfig, PositionAuthority, ServerConfig},
    experiment::{Experiment, ExperimentRegistry},
    hardware::{RigFactory, SharedHardware},
    host::Host,
    protocol::{PositionReply, PositionUpdate, ViewerPosition},
    reward::WaterDelivery,
    sensor_frame::SensorFrame,
};
use serde_json::{json, Value};
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

fn hallway(registry: &ExperimentRegistry, overrides: Value) -> Experiment {
    let config = ExperimentConfig::default().overlay(&overrides).unwrap();
    registry.create("hallway", config).unwrap()
}

#[test]
fn hallway_run_rewards_once_and_resets() {
    let dir = tempfile::tempdir().unwrap();
    let reward = Arc::new(Mutex::new(WaterDelivery::simulated(Duration::from_secs(1))));
    let shared = SharedHardware {
        source: Mutex::new(None),
        buffer: Default::default(),
        reward: Some(Arc::clone(&reward)),
    };
    let registry = ExperimentRegistry::with_builtin();
    let mut exp = hallway(
        &registry,
        json!({
            "trialEndDistance": 2.0,
            "logDir": dir.path(),
            "reward": { "durationMs": 0 },
        }),
    );

    let t0 = Instant::now();
    exp.initialize(&RigFactory, Some(&shared), 16, t0).unwrap();

    let mut resets = 0;
    let mut last_y = 0.0;
    for i in 1..=20u64 {
        shared.buffer.push(SensorFrame::uniform(i * 50_000, 0.0, 3.6));
        let now = t0 + Duration::from_millis(i * 50);
        let snapshot = exp.tick(now).unwrap().snapshot.unwrap();
        let y = snapshot.player.position.z;
        if y < last_y {
            resets += 1;
            assert_eq!(i, 16);
            assert!(snapshot.experiment.is_trial_start);
        }
        last_y = y;
    }

    let trial = &exp.subject().trial;
    assert_eq!(trial.trial_number, 1);
    assert_eq!(trial.num_rewards, 1);
    assert_eq!(resets, 1);
    assert!((exp.subject().pose.y - 4.0 * 0.13104).abs() < 1e-9);
    assert_eq!(reward.lock().unwrap().deliveries(), 1);

    let summary = exp.terminate(t0 + Duration::from_secs(1));
    assert_eq!(summary.num_rewards, 1);
    assert_eq!(summary.reward_rate, 1.0);

    let log = std::fs::read_dir(dir.path())
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let text = std::fs::read_to_string(log).unwrap();
    // header plus one row per frame
    assert_eq!(text.lines().count(), 21);
    let water_rows = text
        .lines()
        .skip(1)
        .filter(|l| l.ends_with("\t1"))
        .count();
    assert_eq!(water_rows, 1);
}

#[test]
fn frontend_fall_times_out_without_reward() {
    let registry = ExperimentRegistry::with_builtin();
    let mut exp = hallway(
        &registry,
        json!({ "positionAuthority": "frontend", "logDir": null }),
    );
    assert_eq!(exp.authority(), PositionAuthority::Frontend);

    let shared = SharedHardware::detached();
    let t0 = Instant::now();
    exp.initialize(&RigFactory, Some(&shared), 16, t0).unwrap();

    let at = |height: f64| PositionUpdate {
        position: ViewerPosition {
            x: 0.0,
            y: height,
            z: 1.0,
            theta: 0.0,
        },
        seq: None,
    };
    let later = |ms: u64| t0 + Duration::from_millis(ms);

    // a falling player is confirmed but locked in place on the viewer
    let reply = exp.process_position_update(at(0.1), t0);
    let PositionReply::Confirm(confirm) = reply else {
        panic!("expected a confirm, got {:?}", reply);
    };
    assert_eq!(confirm.action, "update");
    assert!(confirm.lock_movement);
    assert!(exp.subject().trial.is_falling);
    assert!(matches!(
        exp.process_position_update(at(-3.0), later(3000)),
        PositionReply::Confirm(c) if c.lock_movement
    ));

    let reply = exp.process_position_update(at(-8.0), later(5100));
    let PositionReply::Reset(directive) = reply else {
        panic!("expected a reset, got {:?}", reply);
    };
    assert_eq!(directive.action, "set");
    assert!(!directive.lock_movement);
    assert_eq!(directive.position.z, 0.0);
    assert_eq!(directive.position.y, 0.5);

    // still below ground: the viewer has not applied the reset yet
    assert!(matches!(
        exp.process_position_update(at(-8.5), later(5150)),
        PositionReply::Reset(_)
    ));
    assert!(matches!(
        exp.process_position_update(at(0.5), later(5200)),
        PositionReply::Confirm(c) if !c.lock_movement
    ));

    let trial = &exp.subject().trial;
    assert_eq!(trial.fall_count, 1);
    assert_eq!(trial.num_rewards, 0);
    assert_eq!(trial.trial_number, 0);
    assert!(!trial.is_falling);
}

#[test]
fn second_registration_leaves_the_first_running() {
    let mut config = ServerConfig::default();
    config.defaults.log_dir = None;
    let host = Host::new(
        config,
        ExperimentRegistry::with_builtin(),
        Box::new(RigFactory),
        SharedHardware::detached(),
    )
    .unwrap();

    let register = |id: &str| -> Value {
        let message = json!({
            "type": "experiment_register",
            "requestId": id,
            "data": { "experimentId": id },
        });
        serde_json::from_str(&host.handle_message(&message.to_string())).unwrap()
    };

    let first = register("hallway");
    assert_eq!(first["type"], "experiment_registered");
    let before: Value =
        serde_json::from_str(&host.handle_message(r#"{"type":"status_request"}"#)).unwrap();

    let second = register("autonomous_hallway");
    assert_eq!(second["type"], "experiment_error");
    assert_eq!(second["requestId"], "autonomous_hallway");
    assert_eq!(second["data"]["code"], "EXPERIMENT_ALREADY_ACTIVE");
    assert_eq!(second["data"]["activeExperiment"], "hallway");

    let after: Value =
        serde_json::from_str(&host.handle_message(r#"{"type":"status_request"}"#)).unwrap();
    assert_eq!(after["data"]["activeExperiment"], "hallway");
    assert_eq!(
        after["data"]["state"]["experiment"]["trialNumber"],
        before["data"]["state"]["experiment"]["trialNumber"]
    );
    host.shutdown();
}
