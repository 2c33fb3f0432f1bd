//! Reconnect supervision and error recovery

mod common;

use std::time::Duration;

use common::{connected, wait_for, STATUS};
use plcsrv::hardware::PlcMethod;
use plcsrv::lifecycle::StopOutcome;
use plcsrv::reconnect::SupervisorState;
use plcsrv::store::connection_status_key;
use plcsrv::{PlcError, TagValue, ValueStore};

#[tokio::test(start_paused = true)]
async fn test_supervisor_retries_connect_errors() {
    let h = connected(0.1).await;
    h.sim
        .fail_next(PlcMethod::Open, PlcError::connect("host unreachable"));
    h.sim
        .fail_next(PlcMethod::Open, PlcError::connect("host unreachable"));

    h.registry.start_plc_tag_readers().unwrap();
    let supervisor = h.registry.supervisor(STATUS).unwrap();

    let exit = tokio::time::timeout(Duration::from_secs(10), supervisor.join())
        .await
        .unwrap();
    assert_eq!(exit, Some(Ok(())));
    assert_eq!(supervisor.attempts(), 3);
    assert_eq!(supervisor.state(), SupervisorState::Succeeded);
    assert_eq!(h.sim.call_count(PlcMethod::Open), 3);

    assert!(h.registry.supervisor(STATUS).is_none());
    assert!(h.registry.poller(STATUS).is_some());
    assert_eq!(
        h.store.get(&connection_status_key(STATUS)),
        Some(TagValue::Bool(true))
    );

    h.registry.stop_plc_tag_readers().await;
    h.registry.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_does_not_retry_bad_tag_name() {
    let h = connected(0.1).await;
    h.sim
        .fail_next(PlcMethod::Open, PlcError::bad_tag_name("R_testCStatus"));

    h.registry.start_plc_tag_readers().unwrap();
    let supervisor = h.registry.supervisor(STATUS).unwrap();
    let exit = tokio::time::timeout(Duration::from_secs(10), supervisor.join())
        .await
        .unwrap();
    assert_eq!(exit, Some(Ok(())));
    assert_eq!(supervisor.state(), SupervisorState::Failed);
    assert_eq!(supervisor.attempts(), 1);

    // Several reconnect intervals later nothing has been retried
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.sim.call_count(PlcMethod::Open), 1);
    assert!(h.registry.supervisor(STATUS).is_none());
    assert!(h.registry.poller(STATUS).is_none());
    assert!(!h.registry.channel(STATUS).unwrap().is_connected());

    h.registry.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_recovery_restarts_after_timeout() {
    let h = connected(0.1).await;
    h.registry.start_plc_tag_readers().unwrap();
    assert!(wait_for(Duration::from_secs(5), || h.registry.is_tag_read_status()).await);
    let first = h.registry.poller(STATUS).unwrap();

    h.registry
        .recovery()
        .recover(STATUS, PlcError::timeout("read timed out"))
        .await
        .unwrap();
    assert!(first.is_finished());
    assert_eq!(h.sim.call_count(PlcMethod::Close), 1);

    assert!(
        wait_for(Duration::from_secs(5), || h.registry.is_tag_read_status()).await,
        "reading never resumed"
    );
    let second = h.registry.poller(STATUS).unwrap();
    assert!(!std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(h.sim.call_count(PlcMethod::Open), 2);
    assert_eq!(h.registry.open_channel_names(), vec!["R_testCStatus (2)"]);

    h.registry.stop_plc_tag_readers().await;
    h.registry.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_recovery_bad_tag_name_is_terminal() {
    let h = connected(0.1).await;
    h.registry.start_plc_tag_readers().unwrap();
    assert!(wait_for(Duration::from_secs(5), || h.registry.is_tag_read_status()).await);

    h.registry
        .recovery()
        .recover(STATUS, PlcError::bad_tag_name("R_testCStatus"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(h.registry.poller(STATUS).is_none());
    assert!(h.registry.supervisor(STATUS).is_none());
    assert!(!h.registry.channel(STATUS).unwrap().is_connected());
    assert_eq!(h.sim.call_count(PlcMethod::Open), 1);
    assert_eq!(
        h.store.get(&connection_status_key(STATUS)),
        Some(TagValue::Bool(false))
    );
    assert!(h.registry.open_channel_names().is_empty());

    h.registry.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_poller_hardware_error_triggers_recovery() {
    let h = connected(0.1).await;
    h.registry.start_plc_tag_readers().unwrap();
    assert!(wait_for(Duration::from_secs(5), || h.registry.is_tag_read_status()).await);

    h.sim
        .fail_next(PlcMethod::Read, PlcError::not_handled("unsupported service"));
    assert!(
        wait_for(Duration::from_secs(5), || h.registry.poller(STATUS).is_none()).await,
        "poller was not torn down"
    );

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!h.registry.channel(STATUS).unwrap().is_connected());
    assert!(h.registry.supervisor(STATUS).is_none());
    assert_eq!(h.sim.call_count(PlcMethod::Open), 1);
    assert_eq!(h.sim.open_connections(), 0);

    h.registry.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_recovery_close_failure_is_fatal() {
    let h = connected(0.1).await;
    h.registry.start_plc_tag_readers().unwrap();
    assert!(wait_for(Duration::from_secs(5), || h.registry.is_tag_read_status()).await);

    h.sim
        .fail_next(PlcMethod::Close, PlcError::transport("bus fault"));
    let err = h
        .registry
        .recovery()
        .recover(STATUS, PlcError::timeout("read timed out"))
        .await
        .unwrap_err();
    assert!(matches!(err, PlcError::Transport(_)));

    // Gave up before touching the poller
    assert!(h.registry.poller(STATUS).is_some());

    h.registry.stop_plc_tag_readers().await;
    h.registry.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_stopped_mid_open_closes_channel() {
    let h = connected(0.1).await;
    h.sim.set_latency(Duration::from_millis(200));
    h.sim
        .fail_next(PlcMethod::Close, PlcError::transport("bus fault"));

    h.registry.start_plc_tag_readers().unwrap();
    let supervisor = h.registry.supervisor(STATUS).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Open completes after the stop request, its close then fails
    let outcome = supervisor.stop().await;
    assert_eq!(outcome, StopOutcome::Stopped(Ok(())));
    assert_eq!(supervisor.attempts(), 1);
    assert_eq!(h.sim.call_count(PlcMethod::Open), 1);
    assert_eq!(h.sim.call_count(PlcMethod::Close), 1);
    assert!(!h.registry.channel(STATUS).unwrap().is_connected());
    assert!(h.registry.poller(STATUS).is_none());
    assert!(h.registry.open_channel_names().is_empty());
}
