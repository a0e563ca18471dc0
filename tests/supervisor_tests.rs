//! Supervisor scenarios driven tick by tick over a mock process control

mod common;

use common::{mock_supervisor, test_config};
use dpmon::heartbeat::SlotObservation;
use dpmon::process::{ExitStatus, ProcessSlot, RunState};
use dpmon::signal::SignalEvent;
use nix::sys::signal::Signal;
use std::time::{Duration, Instant};

#[test]
fn test_frozen_heartbeat_kills_once_on_tick_61() {
    let (mut sup, region) = mock_supervisor(test_config());
    sup.activate_autostart();
    let mut now = Instant::now();

    sup.on_timeout(now);
    let pid = sup.lifecycle().table()[ProcessSlot::DataPlane]
        .pid
        .expect("data plane launched");

    region.set_active(0, true);
    region.store_counter(0, 42);
    now += Duration::from_secs(1);
    let report = sup.on_timeout(now).expect("data plane is active");
    assert_eq!(report.slots[0], SlotObservation::Alive { counter: 42 });

    for tick in 1..=61u32 {
        now += Duration::from_secs(1);
        let report = sup.on_timeout(now).expect("data plane is active");
        let kills = sup.lifecycle().control().signals_for(pid);
        if tick < 61 {
            assert_eq!(
                report.slots[0],
                SlotObservation::Missed {
                    counter: 42,
                    streak: tick
                }
            );
            assert!(kills.is_empty(), "killed early on tick {}", tick);
        } else {
            assert_eq!(report.slots[0], SlotObservation::Wedged { counter: 42 });
            assert_eq!(kills, vec![Signal::SIGSEGV]);
        }
    }
    assert_eq!(sup.sampler().miss_streak(0), 0);
    assert!(sup.lifecycle().table()[ProcessSlot::DataPlane].kill_requested);
}

#[test]
fn test_several_wedged_threads_cause_one_kill() {
    let mut config = test_config();
    config.heartbeat.miss_kill_threshold = 3;
    let (mut sup, region) = mock_supervisor(config);
    sup.activate_autostart();
    let mut now = Instant::now();
    sup.on_timeout(now);
    let pid = sup.lifecycle().table()[ProcessSlot::DataPlane].pid.unwrap();

    for idx in 0..4 {
        region.set_active(idx, true);
    }
    for _ in 0..4 {
        now += Duration::from_secs(1);
        sup.on_timeout(now);
    }

    assert_eq!(sup.lifecycle().control().signals_for(pid).len(), 1);
}

#[test]
fn test_progress_keeps_worker_alive() {
    let (mut sup, region) = mock_supervisor(test_config());
    sup.activate_autostart();
    region.set_active(0, true);
    let mut now = Instant::now();

    for _ in 0..200 {
        region.beat(0);
        now += Duration::from_secs(1);
        sup.on_timeout(now);
        assert_eq!(sup.sampler().miss_streak(0), 0);
    }
    assert!(sup.lifecycle().control().signals.is_empty());
}

#[test]
fn test_paused_data_plane_is_not_sampled() {
    let (mut sup, region) = mock_supervisor(test_config());
    sup.activate_autostart();
    region.set_active(0, true);
    let mut now = Instant::now();
    sup.on_timeout(now);

    sup.flags().raise(SignalEvent::PauseDataPlane);
    for _ in 0..100 {
        now += Duration::from_secs(1);
        assert!(sup.on_timeout(now).is_none());
    }
    assert!(!sup.lifecycle().table()[ProcessSlot::DataPlane].active);
    assert!(sup.lifecycle().control().signals.is_empty());

    sup.flags().raise(SignalEvent::ResumeDataPlane);
    now += Duration::from_secs(1);
    assert!(sup.on_timeout(now).is_some());
    assert!(sup.lifecycle().table()[ProcessSlot::DataPlane].active);
}

#[test]
fn test_one_child_exit_event_reaps_all_children() {
    let mut config = test_config();
    config.autostart = vec![
        ProcessSlot::Control,
        ProcessSlot::DataPlane,
        ProcessSlot::Agent,
    ];
    let (mut sup, _region) = mock_supervisor(config);
    sup.activate_autostart();
    let start = Instant::now();
    sup.on_timeout(start);

    let pids: Vec<_> = sup
        .lifecycle()
        .control()
        .spawned
        .iter()
        .map(|(_, pid)| *pid)
        .collect();
    assert_eq!(pids.len(), 3);
    for pid in &pids {
        sup.lifecycle_mut()
            .control_mut()
            .exit(*pid, ExitStatus::Exited { code: 1 });
    }

    sup.flags().raise(SignalEvent::ChildExited);
    sup.dispatch_signals(start + Duration::from_secs(30));

    for slot in [
        ProcessSlot::Control,
        ProcessSlot::DataPlane,
        ProcessSlot::Agent,
    ] {
        let entry = &sup.lifecycle().table()[slot];
        assert!(!entry.running);
        assert!(entry.pid.is_none());
        assert_eq!(entry.state, RunState::Exited);
        assert_eq!(entry.exit_status, Some(ExitStatus::Exited { code: 1 }));
    }
    assert!(sup.lifecycle().control().exits.is_empty());
}

#[test]
fn test_killed_data_plane_is_relaunched() {
    let mut config = test_config();
    config.heartbeat.miss_kill_threshold = 2;
    let (mut sup, region) = mock_supervisor(config);
    sup.activate_autostart();
    let mut now = Instant::now();
    sup.on_timeout(now);
    let first = sup.lifecycle().table()[ProcessSlot::DataPlane].pid.unwrap();
    region.set_active(0, true);

    // Outlive the short-live window before wedging
    now += Duration::from_secs(60);
    for _ in 0..3 {
        now += Duration::from_secs(1);
        sup.on_timeout(now);
    }
    assert_eq!(sup.lifecycle().control().signals_for(first).len(), 1);

    sup.lifecycle_mut().control_mut().exit(
        first,
        ExitStatus::Signaled {
            signal: libc::SIGSEGV,
            core_dumped: true,
        },
    );
    sup.flags().raise(SignalEvent::ChildExited);
    sup.dispatch_signals(now);
    assert_eq!(
        sup.lifecycle().table()[ProcessSlot::DataPlane].state,
        RunState::Killed
    );

    now += Duration::from_secs(1);
    sup.on_timeout(now);
    let entry = &sup.lifecycle().table()[ProcessSlot::DataPlane];
    assert!(entry.running);
    assert_ne!(entry.pid, Some(first));
    assert_eq!(entry.short_live_count, 0);
}

#[test]
fn test_relaunched_data_plane_starts_with_fresh_streak() {
    let (mut sup, region) = mock_supervisor(test_config());
    sup.activate_autostart();
    let mut now = Instant::now();
    sup.on_timeout(now);
    let first = sup.lifecycle().table()[ProcessSlot::DataPlane].pid.unwrap();

    region.set_active(0, true);
    region.store_counter(0, 42);
    now += Duration::from_secs(1);
    sup.on_timeout(now);

    // One tick short of the kill threshold
    for _ in 0..59 {
        now += Duration::from_secs(1);
        sup.on_timeout(now);
    }
    assert_eq!(sup.sampler().miss_streak(0), 59);
    assert!(sup.lifecycle().control().signals_for(first).is_empty());

    // Long-lived run, so the relaunch is immediate
    sup.lifecycle_mut()
        .control_mut()
        .exit(first, ExitStatus::Exited { code: 1 });
    sup.flags().raise(SignalEvent::ChildExited);
    sup.dispatch_signals(now);

    now += Duration::from_secs(1);
    sup.on_timeout(now);
    let second = sup.lifecycle().table()[ProcessSlot::DataPlane].pid.unwrap();
    assert_ne!(second, first);
    assert_eq!(sup.sampler().miss_streak(0), 0);

    // The new instance gets the full window before it is killed
    for _ in 0..59 {
        now += Duration::from_secs(1);
        sup.on_timeout(now);
    }
    assert_eq!(sup.sampler().miss_streak(0), 59);
    assert!(sup.lifecycle().control().signals_for(second).is_empty());
}

#[test]
fn test_crash_looping_worker_backs_off() {
    let (mut sup, _region) = mock_supervisor(test_config());
    sup.activate_autostart();
    let start = Instant::now();
    sup.on_timeout(start);
    let pid = sup.lifecycle().table()[ProcessSlot::DataPlane].pid.unwrap();

    sup.lifecycle_mut()
        .control_mut()
        .exit(pid, ExitStatus::Exited { code: 1 });
    sup.flags().raise(SignalEvent::ChildExited);
    let died = start + Duration::from_millis(200);
    sup.dispatch_signals(died);

    let entry = &sup.lifecycle().table()[ProcessSlot::DataPlane];
    assert_eq!(entry.short_live_count, 1);
    assert_eq!(entry.consecutive_failures, 1);

    // Backoff is 1s after the first failure
    sup.on_timeout(died + Duration::from_millis(500));
    assert!(!sup.lifecycle().table()[ProcessSlot::DataPlane].running);
    sup.on_timeout(died + Duration::from_secs(1));
    assert!(sup.lifecycle().table()[ProcessSlot::DataPlane].running);
}

#[test]
fn test_failed_launch_does_not_abort_the_loop() {
    let (mut sup, _region) = mock_supervisor(test_config());
    let path = sup.lifecycle().table()[ProcessSlot::DataPlane].path.clone();
    sup.lifecycle_mut().control_mut().failing_paths.insert(path);
    sup.activate_autostart();

    let now = Instant::now();
    sup.on_timeout(now);
    let entry = &sup.lifecycle().table()[ProcessSlot::DataPlane];
    assert!(!entry.running);
    assert!(entry.pid.is_none());
    assert_eq!(entry.state, RunState::Stopped);
    assert!(entry.next_start_at.is_some());
}

#[test]
fn test_stop_on_slot_without_pid_is_noop() {
    let (mut sup, _region) = mock_supervisor(test_config());
    for slot in ProcessSlot::ALL {
        sup.lifecycle_mut()
            .stop_process(slot, Signal::SIGTERM, true)
            .unwrap();
    }
    assert!(sup.lifecycle().control().signals.is_empty());
}

#[test]
fn test_no_sampling_once_exit_is_requested() {
    let (mut sup, region) = mock_supervisor(test_config());
    sup.activate_autostart();
    region.set_active(0, true);
    region.store_counter(0, 9);
    let now = Instant::now();
    sup.on_timeout(now);
    assert_eq!(sup.sampler().last_seen(0), 9);

    sup.flags().raise(SignalEvent::Terminate);
    assert!(sup.on_timeout(now + Duration::from_secs(1)).is_none());
    assert_eq!(sup.sampler().miss_streak(0), 0);
}

#[tokio::test]
async fn test_terminate_runs_orderly_shutdown() {
    let (mut sup, _region) = mock_supervisor(test_config());
    sup.activate_autostart();
    sup.on_timeout(Instant::now());

    let flags = sup.flags().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        flags.raise(SignalEvent::Terminate);
    });
    tokio::time::timeout(Duration::from_secs(5), sup.run())
        .await
        .expect("loop should return after terminate")
        .unwrap();

    assert!(sup.status().iter().all(|p| !p.active));
    assert!(!sup.channel().is_mapped());
    assert!(sup.lifecycle().control().restored_child_handler);
    assert!(sup.flags().child_exit_detached());
    // Children are left running unless configured otherwise
    assert!(sup.lifecycle().table()[ProcessSlot::DataPlane].running);
    assert!(sup.lifecycle().control().signals.is_empty());
}

#[tokio::test]
async fn test_child_exit_after_shutdown_is_ignored() {
    let (mut sup, _region) = mock_supervisor(test_config());
    sup.activate_autostart();
    sup.on_timeout(Instant::now());
    let pid = sup.lifecycle().table()[ProcessSlot::DataPlane].pid.unwrap();

    sup.shutdown().await.unwrap();
    sup.lifecycle_mut()
        .control_mut()
        .exit(pid, ExitStatus::Exited { code: 0 });
    sup.flags().raise(SignalEvent::ChildExited);
    sup.dispatch_signals(Instant::now());

    assert_eq!(sup.lifecycle().control().exits.len(), 1);
}
