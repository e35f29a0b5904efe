//! Update attempts against scripted collaborators.

use super::harness::{image, metadata, release_url, Ending, Route, TestRig, REPO};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use zeus_updater::error::{FetchError, ReadError};
use zeus_updater::event::UpdateEvent;
use zeus_updater::image::HEADER_SIZE;
use zeus_updater::storage::Slot;
use zeus_updater::{UpdateChannel, UpdateDirection, UpdateError, UpdateOutcome, Version};

fn pinned(tag: &str) -> UpdateChannel {
    UpdateChannel::from(tag)
}

#[test]
fn test_latest_channel_installs_upgrade() {
    let rig = TestRig::running("1.2.3");
    let firmware = image("1.2.4");
    rig.publish(&UpdateChannel::Latest, firmware.clone());

    let outcome = rig.manager(UpdateChannel::Latest).update_lock().unwrap();

    assert_eq!(
        outcome,
        UpdateOutcome::Installed {
            version: Version::new(1, 2, 4),
            bytes_written: firmware.len() as u64,
        }
    );
    rig.storage.with(|state| {
        assert_eq!(state.begin_calls, 1);
        assert_eq!(state.finalize_calls, 1);
        assert_eq!(state.abort_calls, 0);
        assert_eq!(state.installed.as_deref(), Some(firmware.as_slice()));
        assert_eq!(state.boot_target, Some(Slot::new("ota_1")));
    });
    assert_eq!(rig.process.restarts(), 1);

    let requests = rig.transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url, release_url(&UpdateChannel::Latest));
    let agent = requests[0].header("user-agent").unwrap();
    assert!(agent.contains(REPO), "unexpected user agent {agent}");
}

#[test]
fn test_latest_channel_skips_same_and_older() {
    for offered in ["1.2.3", "1.2.2", "1.1.9", "0.9.0"] {
        let rig = TestRig::running("1.2.3");
        rig.publish(&UpdateChannel::Latest, image(offered));

        let outcome = rig.manager(UpdateChannel::Latest).update_lock().unwrap();

        assert!(
            matches!(outcome, UpdateOutcome::UpToDate { .. }),
            "{offered} should not be installed from latest, got {outcome}"
        );
        rig.storage.with(|state| assert_eq!(state.begin_calls, 0));
        assert_eq!(rig.process.restarts(), 0);
    }
}

#[test]
fn test_pinned_channel_installs_downgrade() {
    let channel = pinned("v1.1.0");
    let rig = TestRig::running("1.2.3");
    rig.publish(&channel, image("v1.1.0"));

    let outcome = rig.manager(channel).update_lock().unwrap();

    assert!(matches!(outcome, UpdateOutcome::Installed { .. }));
    rig.storage.with(|state| {
        assert_eq!(state.finalize_calls, 1);
        assert_eq!(state.boot_target, Some(Slot::new("ota_1")));
    });
    assert_eq!(rig.process.restarts(), 1);
}

#[test]
fn test_pinned_channel_installs_upgrade() {
    let channel = pinned("v1.3.0");
    let rig = TestRig::running("1.2.3");
    rig.publish(&channel, image("v1.3.0"));

    let outcome = rig.manager(channel.clone()).update_lock().unwrap();

    assert!(matches!(
        outcome,
        UpdateOutcome::Installed { ref version, .. } if *version == Version::new(1, 3, 0)
    ));
    rig.storage.with(|state| {
        assert_eq!(state.begin_calls, 1);
        assert_eq!(state.finalize_calls, 1);
        assert_eq!(state.boot_target, Some(Slot::new("ota_1")));
    });
    assert_eq!(rig.transport.requests()[0].url, release_url(&channel));
    assert_eq!(rig.process.restarts(), 1);
}

#[test]
fn test_dirty_running_build_is_replaced_from_pinned_channel() {
    let channel = pinned("v1.2.4");
    let rig = TestRig::running("1.2.3-dirty");
    rig.publish(&channel, image("v1.2.4"));

    let outcome = rig.manager(channel).update_lock().unwrap();

    assert!(matches!(outcome, UpdateOutcome::Installed { .. }));
    rig.storage.with(|state| {
        assert_eq!(state.begin_calls, 1);
        assert_eq!(state.boot_target, Some(Slot::new("ota_1")));
    });
    assert_eq!(rig.process.restarts(), 1);
}

#[test]
fn test_pinned_channel_skips_same_version() {
    let channel = pinned("v1.2.3");
    let rig = TestRig::running("1.2.3");
    rig.publish(&channel, image("v1.2.3"));

    let outcome = rig.manager(channel).update_lock().unwrap();

    assert_eq!(
        outcome,
        UpdateOutcome::UpToDate {
            running: Version::new(1, 2, 3),
            candidate: Version::new(1, 2, 3),
            direction: UpdateDirection::NoChange,
        }
    );
    rig.storage.with(|state| assert_eq!(state.begin_calls, 0));
}

#[test]
fn test_dirty_running_build_is_never_upgraded_from_latest() {
    let rig = TestRig::running("1.2.3-dirty");
    rig.publish(&UpdateChannel::Latest, image("2.0.0"));

    let outcome = rig.manager(UpdateChannel::Latest).update_lock().unwrap();

    match outcome {
        UpdateOutcome::UpToDate { direction, .. } => {
            assert_eq!(direction, UpdateDirection::Downgrade);
        }
        other => panic!("dirty build must not be replaced from latest, got {other}"),
    }
    rig.storage.with(|state| assert_eq!(state.begin_calls, 0));
}

#[test]
fn test_known_bad_version_is_refused_before_writing() {
    let rig = TestRig::running("1.2.3");
    rig.storage.with(|state| state.last_failed = Some(metadata("1.2.4")));
    rig.publish(&UpdateChannel::Latest, image("1.2.4"));

    let err = rig.manager(UpdateChannel::Latest).update_lock().unwrap_err();

    assert!(
        matches!(err, UpdateError::KnownBadVersion { ref version } if version == "1.2.4"),
        "unexpected error {err:?}"
    );
    rig.storage.with(|state| {
        assert_eq!(state.begin_calls, 0);
        assert!(state.boot_target.is_none());
    });
    assert_eq!(rig.process.restarts(), 0);
}

#[test]
fn test_other_failed_version_does_not_block_update() {
    let rig = TestRig::running("1.2.3");
    rig.storage.with(|state| state.last_failed = Some(metadata("1.2.4")));
    rig.publish(&UpdateChannel::Latest, image("1.2.5"));

    let outcome = rig.manager(UpdateChannel::Latest).update_lock().unwrap();

    assert!(matches!(outcome, UpdateOutcome::Installed { .. }));
}

#[test]
fn test_early_close_is_connection_reset_and_aborts() {
    let rig = TestRig::running("1.2.3");
    let firmware = image("1.2.4");
    rig.transport.route(
        &release_url(&UpdateChannel::Latest),
        Route::body(firmware).ending(Ending::CutAt(3000)),
    );

    let err = rig.manager(UpdateChannel::Latest).update_lock().unwrap_err();

    assert!(err.is_connection_reset(), "unexpected error {err:?}");
    rig.storage.with(|state| {
        assert_eq!(state.begin_calls, 1);
        assert_eq!(state.abort_calls, 1);
        assert_eq!(state.finalize_calls, 0);
        assert!(state.boot_target.is_none());
    });
    assert_eq!(rig.process.restarts(), 0);
}

#[test]
fn test_transport_reset_error_aborts() {
    let rig = TestRig::running("1.2.3");
    rig.transport.route(
        &release_url(&UpdateChannel::Latest),
        Route::body(image("1.2.4"))
            .chunked(1000)
            .ending(Ending::ResetAt(2500)),
    );

    let err = rig.manager(UpdateChannel::Latest).update_lock().unwrap_err();

    match err {
        UpdateError::TransportReadFailed(ReadError::ConnectionReset { received, .. }) => {
            assert_eq!(received, 2500);
        }
        other => panic!("expected connection reset, got {other:?}"),
    }
    rig.storage.with(|state| {
        assert_eq!(state.abort_calls, 1);
        assert_eq!(state.finalize_calls, 0);
    });
}

#[test]
fn test_short_first_read_is_truncated_image() {
    let rig = TestRig::running("1.2.3");
    rig.transport.route(
        &release_url(&UpdateChannel::Latest),
        Route::body(image("1.2.4")).chunked(100),
    );

    let err = rig.manager(UpdateChannel::Latest).update_lock().unwrap_err();

    assert!(
        matches!(
            err,
            UpdateError::TruncatedImage {
                received: 100,
                required: HEADER_SIZE
            }
        ),
        "unexpected error {err:?}"
    );
    rig.storage.with(|state| assert_eq!(state.begin_calls, 0));
}

#[test]
fn test_empty_body_is_truncated_image() {
    let rig = TestRig::running("1.2.3");
    rig.publish(&UpdateChannel::Latest, Vec::new());

    let err = rig.manager(UpdateChannel::Latest).update_lock().unwrap_err();

    assert!(matches!(err, UpdateError::TruncatedImage { received: 0, .. }));
}

#[test]
fn test_body_without_length_installs() {
    let rig = TestRig::running("1.2.3");
    rig.transport.route(
        &release_url(&UpdateChannel::Latest),
        Route::body(image("1.3.0")).without_length(),
    );

    let outcome = rig.manager(UpdateChannel::Latest).update_lock().unwrap();

    assert!(matches!(outcome, UpdateOutcome::Installed { .. }));
}

#[test]
fn test_no_inactive_slot_is_unsupported() {
    let rig = TestRig::running("1.2.3");
    rig.storage.with(|state| state.inactive = None);
    rig.publish(&UpdateChannel::Latest, image("1.2.4"));

    let err = rig.manager(UpdateChannel::Latest).update_lock().unwrap_err();

    assert!(matches!(err, UpdateError::UnsupportedPartitioning));
    assert!(rig.transport.requests().is_empty());
}

#[test]
fn test_garbage_header_is_malformed() {
    let rig = TestRig::running("1.2.3");
    rig.publish(&UpdateChannel::Latest, vec![0xFF; 1024]);

    let err = rig.manager(UpdateChannel::Latest).update_lock().unwrap_err();

    assert!(matches!(err, UpdateError::MalformedHeader(_)));
    rig.storage.with(|state| assert_eq!(state.begin_calls, 0));
}

#[test]
fn test_follows_redirects_to_asset() {
    let rig = TestRig::running("1.2.3");
    let firmware = image("1.2.4");
    let asset = "https://objects.github.test/release-assets/42?token=abc";
    rig.transport.route(
        &release_url(&UpdateChannel::Latest),
        Route::redirect(302, "/zeus/zeus/releases/download/v1.2.4/zeus-esp32.bin"),
    );
    rig.transport.route(
        "https://github.test/zeus/zeus/releases/download/v1.2.4/zeus-esp32.bin",
        Route::redirect(302, asset),
    );
    rig.transport.route(asset, Route::body(firmware));

    let outcome = rig.manager(UpdateChannel::Latest).update_lock().unwrap();

    assert!(matches!(outcome, UpdateOutcome::Installed { .. }));
    let urls: Vec<String> = rig.transport.requests().into_iter().map(|r| r.url).collect();
    assert_eq!(urls.len(), 3);
    assert_eq!(urls[2], asset);
}

#[test]
fn test_redirect_loop_gives_up() {
    let rig = TestRig::running("1.2.3");
    let url = release_url(&UpdateChannel::Latest);
    rig.transport.route(&url, Route::redirect(307, &url));

    let err = rig.manager(UpdateChannel::Latest).update_lock().unwrap_err();

    assert!(
        matches!(err, UpdateError::Request(FetchError::TooManyRedirects { max: 4, .. })),
        "unexpected error {err:?}"
    );
    assert_eq!(rig.transport.requests().len(), 5);
    rig.storage.with(|state| assert_eq!(state.begin_calls, 0));
}

#[test]
fn test_missing_release_reports_status() {
    let rig = TestRig::running("1.2.3");
    rig.transport
        .route(&release_url(&UpdateChannel::Latest), Route::status(404));

    let err = rig.manager(UpdateChannel::Latest).update_lock().unwrap_err();

    assert!(matches!(
        err,
        UpdateError::Request(FetchError::Status { status: 404, .. })
    ));
}

#[test]
fn test_corrupted_image_fails_validation() {
    let rig = TestRig::running("1.2.3");
    let mut firmware = image("1.2.4");
    firmware[HEADER_SIZE + 100] ^= 0x5A;
    rig.publish(&UpdateChannel::Latest, firmware);

    let err = rig.manager(UpdateChannel::Latest).update_lock().unwrap_err();

    match err {
        UpdateError::ImageValidationFailed(source) => assert!(source.is_validation()),
        other => panic!("expected validation failure, got {other:?}"),
    }
    rig.storage.with(|state| {
        assert_eq!(state.finalize_calls, 1);
        assert!(state.installed.is_none());
        assert!(state.boot_target.is_none());
    });
    assert_eq!(rig.process.restarts(), 0);
}

#[test]
fn test_finalize_io_failure_is_not_a_validation_failure() {
    let rig = TestRig::running("1.2.3");
    rig.storage.with(|state| state.fail_finalize = true);
    rig.publish(&UpdateChannel::Latest, image("1.2.4"));

    let err = rig.manager(UpdateChannel::Latest).update_lock().unwrap_err();

    match err {
        UpdateError::StorageFinalizeFailed(source) => assert!(!source.is_validation()),
        other => panic!("expected finalize failure, got {other:?}"),
    }
    rig.storage.with(|state| {
        assert_eq!(state.finalize_calls, 1);
        assert!(state.installed.is_none());
        assert!(state.boot_target.is_none());
    });
    assert_eq!(rig.process.restarts(), 0);
}

#[test]
fn test_begin_write_failure() {
    let rig = TestRig::running("1.2.3");
    rig.storage.with(|state| state.fail_begin = true);
    rig.publish(&UpdateChannel::Latest, image("1.2.4"));

    let err = rig.manager(UpdateChannel::Latest).update_lock().unwrap_err();

    assert!(matches!(err, UpdateError::StorageBeginFailed(_)));
    rig.storage.with(|state| assert_eq!(state.finalize_calls, 0));
}

#[test]
fn test_write_failure_aborts_session() {
    let rig = TestRig::running("1.2.3");
    rig.storage.with(|state| state.fail_write_after = Some(3000));
    rig.publish(&UpdateChannel::Latest, image("1.2.4"));

    let err = rig.manager(UpdateChannel::Latest).update_lock().unwrap_err();

    assert!(matches!(err, UpdateError::StorageWriteFailed(_)));
    rig.storage.with(|state| {
        assert_eq!(state.abort_calls, 1);
        assert_eq!(state.finalize_calls, 0);
    });
}

#[test]
fn test_boot_target_failure_skips_restart() {
    let rig = TestRig::running("1.2.3");
    rig.storage.with(|state| state.fail_boot_target = true);
    rig.publish(&UpdateChannel::Latest, image("1.2.4"));

    let err = rig.manager(UpdateChannel::Latest).update_lock().unwrap_err();

    assert!(matches!(err, UpdateError::BootTargetUpdateFailed(_)));
    assert_eq!(rig.process.restarts(), 0);
}

#[test]
fn test_trylock_during_attempt_is_busy() {
    let rig = TestRig::running("1.2.3");
    rig.publish(&UpdateChannel::Latest, image("1.2.4"));
    let gate = rig.transport.gate_next_request();
    let manager = Arc::new(rig.manager(UpdateChannel::Latest));

    let background = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || manager.update_lock())
    };
    gate.wait_entered();
    assert!(manager.is_busy());

    let started = Instant::now();
    let err = manager.update_trylock().unwrap_err();
    assert!(matches!(err, UpdateError::Busy));
    assert!(started.elapsed() < Duration::from_secs(1));

    gate.release();
    let outcome = background.join().unwrap().unwrap();
    assert!(matches!(outcome, UpdateOutcome::Installed { .. }));
    assert_eq!(rig.transport.requests().len(), 1);
    assert_eq!(rig.process.restarts(), 1);
}

#[test]
fn test_trylock_when_idle_runs_attempt() {
    let rig = TestRig::running("1.2.3");
    rig.publish(&UpdateChannel::Latest, image("1.2.3"));

    let outcome = rig.manager(UpdateChannel::Latest).update_trylock().unwrap();

    assert!(matches!(outcome, UpdateOutcome::UpToDate { .. }));
}

#[test]
fn test_events_follow_attempt() {
    let rig = TestRig::running("1.2.3");
    rig.publish(&UpdateChannel::Latest, image("1.2.4"));
    let manager = rig.manager(UpdateChannel::Latest);
    let mut events = manager.subscribe_events();

    manager.update_lock().unwrap();

    assert_eq!(
        events.try_recv().unwrap(),
        UpdateEvent::CheckStarted {
            channel: "latest".to_string()
        }
    );
    assert_eq!(
        events.try_recv().unwrap(),
        UpdateEvent::UpdateStarted {
            version: "1.2.4".to_string()
        }
    );
    assert!(matches!(
        events.try_recv().unwrap(),
        UpdateEvent::UpdateInstalled { ref version, .. } if version == "1.2.4"
    ));
    assert!(events.try_recv().is_err());
}

#[test]
fn test_failure_event_carries_reason() {
    let rig = TestRig::running("1.2.3");
    rig.storage.with(|state| state.inactive = None);
    let manager = rig.manager(UpdateChannel::Latest);
    let mut events = manager.subscribe_events();

    let _ = manager.update_lock();

    assert!(matches!(
        events.try_recv().unwrap(),
        UpdateEvent::CheckStarted { .. }
    ));
    match events.try_recv().unwrap() {
        UpdateEvent::UpdateFailed { message } => {
            assert!(message.contains("partitioning"), "unexpected message {message}");
        }
        other => panic!("expected failure event, got {other:?}"),
    }
}
