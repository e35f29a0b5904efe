//! Periodic trigger lifecycle under tokio.

use super::harness::{image, TestRig};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use zeus_updater::event::UpdateEvent;
use zeus_updater::UpdateChannel;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_trigger_repeats_until_shutdown() {
    let rig = TestRig::running("1.2.3");
    rig.publish(&UpdateChannel::Latest, image("1.2.3"));
    let manager = Arc::new(rig.manager_with(UpdateChannel::Latest, Duration::from_millis(10)));
    let mut events = manager.subscribe_events();

    let trigger = manager.start_trigger(Duration::from_millis(20));

    let mut up_to_date = 0;
    timeout(Duration::from_secs(5), async {
        while up_to_date < 3 {
            if let Ok(UpdateEvent::UpToDate { .. }) = events.recv().await {
                up_to_date += 1;
            }
        }
    })
    .await
    .expect("trigger did not repeat the check");

    trigger.shutdown();
    timeout(Duration::from_secs(5), trigger.join())
        .await
        .expect("trigger did not stop")
        .unwrap();

    let seen = rig.transport.requests().len();
    assert!(seen >= 3);
    sleep(Duration::from_millis(60)).await;
    assert_eq!(rig.transport.requests().len(), seen);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_during_settle_delay_skips_attempt() {
    let rig = TestRig::running("1.2.3");
    rig.publish(&UpdateChannel::Latest, image("1.2.4"));
    let manager = Arc::new(rig.manager_with(UpdateChannel::Latest, Duration::from_secs(3600)));

    let trigger = manager.update_init(5);
    sleep(Duration::from_millis(20)).await;
    assert!(!trigger.is_finished());

    trigger.shutdown();
    timeout(Duration::from_secs(5), trigger.join())
        .await
        .expect("trigger did not stop")
        .unwrap();

    assert!(rig.transport.requests().is_empty());
    rig.storage.with(|state| assert_eq!(state.begin_calls, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_attempts_keep_trigger_running() {
    let rig = TestRig::running("1.2.3");
    rig.storage.with(|state| state.fail_begin = true);
    rig.publish(&UpdateChannel::Latest, image("1.2.4"));
    let manager = Arc::new(rig.manager_with(UpdateChannel::Latest, Duration::ZERO));
    let mut events = manager.subscribe_events();

    let trigger = manager.start_trigger(Duration::from_millis(10));

    let mut failures = 0;
    timeout(Duration::from_secs(5), async {
        while failures < 2 {
            if let Ok(UpdateEvent::UpdateFailed { .. }) = events.recv().await {
                failures += 1;
            }
        }
    })
    .await
    .expect("trigger stopped after a failed attempt");

    trigger.shutdown();
    timeout(Duration::from_secs(5), trigger.join())
        .await
        .expect("trigger did not stop")
        .unwrap();
    assert_eq!(rig.process.restarts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_manual_trylock_while_trigger_runs() {
    let rig = TestRig::running("1.2.3");
    rig.publish(&UpdateChannel::Latest, image("1.2.4"));
    let gate = rig.transport.gate_next_request();
    let manager = Arc::new(rig.manager_with(UpdateChannel::Latest, Duration::ZERO));

    let trigger = manager.start_trigger(Duration::from_secs(3600));
    let gate = tokio::task::spawn_blocking(move || {
        gate.wait_entered();
        gate
    })
    .await
    .unwrap();

    let manual = Arc::clone(&manager);
    let result = tokio::task::spawn_blocking(move || manual.update_trylock())
        .await
        .unwrap();
    assert!(matches!(result, Err(zeus_updater::UpdateError::Busy)));

    gate.release();
    timeout(Duration::from_secs(5), async {
        while rig.process.restarts() == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("periodic attempt did not finish");

    trigger.shutdown();
    timeout(Duration::from_secs(5), trigger.join())
        .await
        .expect("trigger did not stop")
        .unwrap();
}
