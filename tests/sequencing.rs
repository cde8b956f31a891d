mod common;

use bikerig::{ControlCommand, RigError, SequenceOutcome, SequenceStep};
use common::{connected_rig, RecordingBus, ScriptedRadio, WAIT};
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

const REQUEST_CONTROL: &[u8] = &[0x00];

fn within(elapsed: Duration, expected_ms: u64) -> bool {
    let expected = Duration::from_millis(expected_ms);
    elapsed + Duration::from_millis(50) >= expected && elapsed <= expected + Duration::from_millis(400)
}

#[test]
fn test_steps_fire_on_schedule_and_actuator_stops_at_end() {
    let radio = Arc::new(ScriptedRadio::default());
    let bus = Arc::new(RecordingBus::default());
    let rig = connected_rig(&radio, Some(&bus));
    assert_eq!(radio.writes(), vec![REQUEST_CONTROL.to_vec()]);

    let started = Instant::now();
    let run = rig
        .start_sequence(vec![
            SequenceStep::new(ControlCommand::Percentage(10), 2, None),
            SequenceStep::new(ControlCommand::PowerWatts(100), 1, Some(30.0)),
            SequenceStep::new(ControlCommand::SimulationGrade(5), 0, None),
        ])
        .unwrap();
    assert!(rig.sequencer().is_running());

    assert_eq!(run.await_result(WAIT).unwrap(), SequenceOutcome::Completed);
    assert!(!rig.sequencer().is_running());
    assert_eq!(rig.sequencer().last_outcome(), Some(SequenceOutcome::Completed));

    let writes = radio.timed_writes();
    let steps: Vec<_> = writes[1..].iter().collect();
    assert_eq!(steps.len(), 3);
    assert_eq!(steps[0].1, vec![0x04, 10]);
    assert_eq!(steps[1].1, vec![0x05, 100, 0]);
    assert_eq!(steps[2].1, vec![0x11, 0, 0, 0xF4, 0x01, 40, 51]);
    assert!(within(steps[0].0 - started, 0));
    assert!(within(steps[1].0 - started, 2_000));
    assert!(within(steps[2].0 - started, 3_000));

    let speeds = bus.timed_speeds();
    assert_eq!(bus.speeds(), vec![3_000, 0]);
    assert!(within(speeds[0].0 - started, 2_000));
    assert!(within(speeds[1].0 - started, 3_000));

    assert!(rig.shutdown());
}

#[test]
fn test_stop_prevents_pending_steps() {
    let radio = Arc::new(ScriptedRadio::default());
    let bus = Arc::new(RecordingBus::default());
    let rig = connected_rig(&radio, Some(&bus));

    let run = rig
        .start_sequence(vec![
            SequenceStep::new(ControlCommand::Percentage(10), 1, None),
            SequenceStep::new(ControlCommand::Percentage(20), 1, Some(12.0)),
        ])
        .unwrap();

    thread::sleep(Duration::from_millis(500));
    assert_eq!(rig.sequencer().current_step(), Some(0));
    assert!(rig.stop_sequence());
    assert!(!rig.sequencer().is_running());

    assert_eq!(run.await_result(WAIT).unwrap(), SequenceOutcome::Stopped);
    thread::sleep(Duration::from_millis(1_000));

    assert_eq!(radio.writes(), vec![REQUEST_CONTROL.to_vec(), vec![0x04, 10]]);
    assert!(bus.speeds().is_empty());
    assert_eq!(rig.sequencer().last_outcome(), Some(SequenceOutcome::Stopped));
    assert!(rig.shutdown());
}

#[test]
fn test_stop_is_idempotent_and_restart_begins_at_first_step() {
    let radio = Arc::new(ScriptedRadio::default());
    let rig = connected_rig(&radio, None);

    assert!(!rig.stop_sequence());

    let steps = vec![
        SequenceStep::new(ControlCommand::Percentage(30), 5, None),
        SequenceStep::new(ControlCommand::Percentage(60), 0, None),
    ];
    let first = rig.start_sequence(steps.clone()).unwrap();
    assert!(matches!(
        rig.start_sequence(steps.clone()),
        Err(RigError::AlreadyRunning)
    ));

    thread::sleep(Duration::from_millis(100));
    assert!(rig.stop_sequence());
    assert!(!rig.stop_sequence());
    assert_eq!(first.await_result(WAIT).unwrap(), SequenceOutcome::Stopped);

    let second = rig.start_sequence(steps).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(rig.sequencer().current_step(), Some(0));
    assert!(rig.stop_sequence());
    assert_eq!(second.await_result(WAIT).unwrap(), SequenceOutcome::Stopped);

    let level_30 = radio.writes().iter().filter(|w| **w == [0x04, 30]).count();
    assert_eq!(level_30, 2);
    assert!(rig.shutdown());
}

#[test]
fn test_negative_delay_fails_the_run_at_that_step() {
    let radio = Arc::new(ScriptedRadio::default());
    let rig = connected_rig(&radio, None);

    let mut broken = SequenceStep::new(ControlCommand::Percentage(40), 0, None);
    broken.delay_secs = -1;
    let run = rig
        .start_sequence(vec![
            SequenceStep::new(ControlCommand::Percentage(20), 0, None),
            broken,
        ])
        .unwrap();

    assert!(matches!(run.await_result(WAIT), Err(RigError::InvalidStep(_))));
    assert!(matches!(
        rig.sequencer().last_outcome(),
        Some(SequenceOutcome::Failed(_))
    ));
    assert!(!rig.sequencer().is_running());

    // the broken step itself is never sent
    thread::sleep(Duration::from_millis(100));
    assert!(!radio.writes().contains(&vec![0x04, 40]));
    assert!(rig.shutdown());
}

#[test]
fn test_actuator_bound_checked_before_field_bus() {
    let radio = Arc::new(ScriptedRadio::default());
    let bus = Arc::new(RecordingBus::default());
    let rig = connected_rig(&radio, Some(&bus));

    for rejected in [80.5, -1.0, f64::NAN, f64::INFINITY] {
        assert!(matches!(
            rig.set_actuator_speed(rejected).await_result(WAIT),
            Err(RigError::OutOfRange { .. })
        ));
    }
    assert!(bus.speeds().is_empty());

    for accepted in [0.0, 12.34, 80.0] {
        rig.set_actuator_speed(accepted).await_result(WAIT).unwrap();
    }
    assert_eq!(bus.speeds(), vec![0, 1_234, 8_000]);
    assert!(rig.shutdown());
}

#[test]
fn test_shutdown_ends_a_running_sequence() {
    let radio = Arc::new(ScriptedRadio::default());
    let rig = connected_rig(&radio, None);

    let run = rig
        .start_sequence(vec![SequenceStep::new(ControlCommand::Percentage(50), 30, None)])
        .unwrap();
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    assert!(rig.shutdown());
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(matches!(
        run.await_result(WAIT),
        Ok(SequenceOutcome::Stopped) | Err(RigError::Cancelled)
    ));
}

#[test]
fn test_oversized_delay_does_not_wedge_the_sequencer() {
    let radio = Arc::new(ScriptedRadio::default());
    let rig = connected_rig(&radio, None);

    let mut endless = SequenceStep::new(ControlCommand::Percentage(10), 0, None);
    endless.delay_secs = i64::MAX;
    let run = rig.start_sequence(vec![endless]).unwrap();

    assert!(matches!(run.await_result(WAIT), Err(RigError::InvalidStep(_))));
    assert!(!rig.sequencer().is_running());

    let restart = rig
        .start_sequence(vec![SequenceStep::new(ControlCommand::Percentage(20), 0, None)])
        .unwrap();
    assert_eq!(restart.await_result(WAIT).unwrap(), SequenceOutcome::Completed);
    assert!(rig.shutdown());
}

#[test]
fn test_empty_sequence_is_refused() {
    let radio = Arc::new(ScriptedRadio::default());
    let rig = connected_rig(&radio, None);

    assert!(matches!(
        rig.start_sequence(Vec::new()),
        Err(RigError::AlreadyRunning)
    ));
    assert!(!rig.sequencer().is_running());
    assert_eq!(rig.sequencer().last_outcome(), None);
    assert!(rig.shutdown());
}
