//! Connection registry: connect lifecycle, transient reads and writes,
//! maintenance channels and command ids

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{
    command_tag, config, connected, harness, status_tag, wait_for, ADDRESS, COMMAND, STATUS,
};
use plcsrv::hardware::PlcMethod;
use plcsrv::registry::{MAX_COMMAND_ID, SIMULATOR_ADDRESS};
use plcsrv::store::{connection_status_key, OPEN_CHANNEL_NAMES};
use plcsrv::{GisStatusView, PlcError, TagValue, ValueStore};

#[tokio::test]
async fn test_connect_sets_up_tags() {
    let h = connected(1.0).await;

    assert_eq!(h.registry.tag_names(), vec![STATUS, COMMAND]);
    assert_eq!(h.registry.status_tag_name().as_deref(), Some(STATUS));
    assert_eq!(h.registry.controller_address().unwrap(), SIMULATOR_ADDRESS);
    assert!(h.registry.is_simulated());
    assert!(h.registry.is_read_tag(STATUS));
    assert!(h.registry.is_write_tag(COMMAND));
    assert!(h.registry.is_valid_tag_item(COMMAND, "setpoint"));
    assert!(!h.registry.is_valid_tag_item(COMMAND, "nope"));
    assert_eq!(
        h.store.get(&connection_status_key(COMMAND)),
        Some(TagValue::Bool(false))
    );
    assert!(!h.registry.is_connected());

    let err = h.registry.connect(&[ADDRESS]).await.unwrap_err();
    assert!(matches!(err, PlcError::InvalidState(_)));
}

#[tokio::test]
async fn test_connect_rejects_bad_input() {
    let h = harness(config(vec![(STATUS, status_tag(1.0))]));
    let err = h.registry.connect(&[ADDRESS, ADDRESS]).await.unwrap_err();
    assert!(matches!(err, PlcError::InvalidArgument(_)));

    let h = harness(config(vec![]));
    let err = h.registry.connect(&[ADDRESS]).await.unwrap_err();
    assert!(matches!(err, PlcError::Config(_)));
}

#[tokio::test]
async fn test_unconnected_registry_refuses_io() {
    let h = harness(config(vec![(COMMAND, command_tag())]));
    let err = h.registry.read_tag(&[COMMAND]).await.unwrap_err();
    assert!(matches!(err, PlcError::InvalidState(_)));
    let err = h
        .registry
        .write_tag(&[("W_testCommand:commandId".to_string(), TagValue::Int(1))])
        .await
        .unwrap_err();
    assert!(matches!(err, PlcError::InvalidState(_)));
}

#[tokio::test]
async fn test_read_tag_opens_and_closes_transiently() {
    let h = connected(1.0).await;
    h.sim.set_block(STATUS, vec![0xE8, 0x07, 0, 0, 9, 0, 0, 0]);

    let values = h
        .registry
        .read_tag(&["R_testCStatus:plcErrCodeMajor", STATUS])
        .await
        .unwrap();

    assert_eq!(values[0], ("R_testCStatus:plcErrCodeMajor".to_string(), TagValue::Int(9)));
    assert!(values.contains(&("R_testCStatus:timeYear".to_string(), TagValue::Int(2024))));
    assert_eq!(values.len(), 4);

    // Both references share one read
    assert_eq!(h.sim.call_count(PlcMethod::Read), 1);
    assert_eq!(h.sim.call_count(PlcMethod::Open), 1);
    assert_eq!(h.sim.open_connections(), 0);
    assert_eq!(
        h.store.get("R_testCStatus:timeYear"),
        Some(TagValue::Int(2024))
    );

    let err = h.registry.read_tag(&["R_testCStatus:nope"]).await.unwrap_err();
    assert!(matches!(err, PlcError::UnknownTag(_)));
}

#[tokio::test]
async fn test_write_tag_fuses_defaults() {
    let h = connected(1.0).await;
    h.store.set("W_testCommand:heartbeat", TagValue::Bool(true));
    h.store.set("W_testCommand:setpoint", TagValue::Real(12.5));

    h.registry
        .write_tag(&[("W_testCommand:commandId".to_string(), TagValue::Int(7))])
        .await
        .unwrap();

    assert_eq!(h.store.get("W_testCommand:commandId"), Some(TagValue::Int(7)));
    assert_eq!(h.store.get("W_testCommand:reset"), Some(TagValue::Bool(false)));
    // Defaults replace whatever the store held
    assert_eq!(h.store.get("W_testCommand:setpoint"), Some(TagValue::Real(0.0)));
    // No default, stored value untouched
    assert_eq!(h.store.get("W_testCommand:heartbeat"), Some(TagValue::Bool(true)));

    assert_eq!(
        h.sim.block(COMMAND).unwrap(),
        vec![7, 0, 0, 0, 0b10, 0, 0, 0, 0, 0, 0, 0]
    );
    assert_eq!(h.sim.call_count(PlcMethod::Write), 1);
    assert_eq!(h.sim.open_connections(), 0);
    assert!(h.registry.open_channel_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_channel_listed_while_open() {
    let h = connected(1.0).await;
    h.sim.set_latency(Duration::from_millis(200));

    let registry = Arc::clone(&h.registry);
    let read = tokio::spawn(async move { registry.read_tag(&[STATUS]).await });
    assert!(
        wait_for(Duration::from_secs(1), || h.registry.is_connected()).await,
        "transient channel never listed"
    );
    assert_eq!(h.registry.open_channel_names(), vec!["R_testCStatus (1)"]);
    assert_eq!(
        h.store.get(&connection_status_key(STATUS)),
        Some(TagValue::Bool(true))
    );

    read.await.unwrap().unwrap();
    assert!(!h.registry.is_connected());
    assert!(!h.store.contains(OPEN_CHANNEL_NAMES));
    assert_eq!(
        h.store.get(&connection_status_key(STATUS)),
        Some(TagValue::Bool(false))
    );

    let registry = Arc::clone(&h.registry);
    let write = tokio::spawn(async move {
        registry
            .write_tag(&[("W_testCommand:commandId".to_string(), TagValue::Int(2))])
            .await
    });
    assert!(wait_for(Duration::from_secs(1), || h.registry.is_connected()).await);
    assert_eq!(h.registry.open_channel_names(), vec!["W_testCommand (2)"]);

    write.await.unwrap().unwrap();
    assert!(h.registry.open_channel_names().is_empty());
    assert_eq!(
        h.store.get(&connection_status_key(COMMAND)),
        Some(TagValue::Bool(false))
    );
}

#[tokio::test]
async fn test_write_tag_validation() {
    let h = connected(1.0).await;

    let err = h.registry.write_tag(&[]).await.unwrap_err();
    assert!(matches!(err, PlcError::InvalidArgument(_)));

    let err = h
        .registry
        .write_tag(&[
            ("W_testCommand:commandId".to_string(), TagValue::Int(1)),
            ("R_testCStatus:timeYear".to_string(), TagValue::Int(1)),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, PlcError::InvalidArgument(_)));

    let err = h
        .registry
        .write_tag(&[("W_testCommand:nope".to_string(), TagValue::Int(1))])
        .await
        .unwrap_err();
    assert!(matches!(err, PlcError::UnknownTag(_)));

    assert_eq!(h.sim.call_count(PlcMethod::Open), 0);
}

#[tokio::test]
async fn test_hardware_write_toggle() {
    let h = connected(1.0).await;
    h.registry.set_hardware_writes(false);

    h.registry
        .write_tag(&[("W_testCommand:commandId".to_string(), TagValue::Int(3))])
        .await
        .unwrap();

    assert_eq!(h.store.get("W_testCommand:commandId"), Some(TagValue::Int(3)));
    assert_eq!(h.sim.call_count(PlcMethod::Write), 0);
    // Channel is still opened and closed around the skipped write
    assert_eq!(h.sim.call_count(PlcMethod::Open), 1);
    assert_eq!(h.sim.call_count(PlcMethod::Close), 1);

    h.registry.set_hardware_writes(true);
    h.registry
        .write_tag(&[("W_testCommand:commandId".to_string(), TagValue::Int(4))])
        .await
        .unwrap();
    assert_eq!(h.sim.call_count(PlcMethod::Write), 1);
    assert_eq!(h.sim.block(COMMAND).unwrap()[0], 4);
}

#[tokio::test]
async fn test_open_channel_list_prefixes() {
    let h = harness(config(vec![("tag1", command_tag()), ("tag10", command_tag())]));
    h.registry.connect(&[ADDRESS]).await.unwrap();

    h.registry.open_plc_connection("tag1").await.unwrap();
    h.registry.open_plc_connection("tag10").await.unwrap();
    assert_eq!(h.registry.open_channel_names(), vec!["tag1 (1)", "tag10 (2)"]);
    assert_eq!(h.registry.open_channel_names_string(), "tag1 (1),tag10 (2)");
    assert!(h.registry.is_connected());

    // Opening again is a no-op
    h.registry.open_plc_connection("tag1").await.unwrap();
    assert_eq!(h.sim.call_count(PlcMethod::Open), 2);

    h.registry.close_plc_connection("tag1").await.unwrap();
    assert_eq!(h.registry.open_channel_names(), vec!["tag10 (2)"]);
    assert_eq!(
        h.store.get(&connection_status_key("tag1")),
        Some(TagValue::Bool(false))
    );

    h.registry.close_plc_connection("tag10").await.unwrap();
    assert!(!h.store.contains(OPEN_CHANNEL_NAMES));
    assert!(!h.registry.is_connected());
}

#[tokio::test]
async fn test_ad_hoc_maintenance_channel() {
    let h = connected(1.0).await;

    h.registry.open_plc_connection("maint").await.unwrap();
    assert_eq!(h.registry.open_channel_names(), vec!["maint (1)"]);
    assert!(h.registry.channel("maint").is_ok());
    assert!(!h.store.contains(&connection_status_key("maint")));

    h.registry.close_plc_connection("maint").await.unwrap();
    assert!(h.registry.channel("maint").is_err());
    assert!(h.registry.open_channel_names().is_empty());

    // Failed open of an ad hoc channel leaves nothing behind
    h.sim
        .fail_next(PlcMethod::Open, PlcError::connect("host unreachable"));
    assert!(h.registry.open_plc_connection("maint").await.is_err());
    assert!(h.registry.channel("maint").is_err());

    // Closing something unknown only warns
    h.registry.close_plc_connection("ghost").await.unwrap();
}

#[tokio::test]
async fn test_disconnect_continues_past_close_failure() {
    let h = harness(config(vec![("tag1", command_tag()), ("tag10", command_tag())]));
    h.registry.connect(&[ADDRESS]).await.unwrap();
    h.registry.open_plc_connection("tag1").await.unwrap();
    h.registry.open_plc_connection("tag10").await.unwrap();

    h.sim
        .fail_next(PlcMethod::Close, PlcError::transport("bus fault"));
    let err = h.registry.disconnect().await.unwrap_err();
    assert!(matches!(err, PlcError::Transport(_)));

    assert_eq!(h.sim.call_count(PlcMethod::Close), 2);
    assert!(h.registry.open_channel_names().is_empty());
    assert!(h.registry.channel("tag1").is_err());
    assert!(h.registry.channel("tag10").is_err());
    assert!(!h.registry.snapshot().connected);

    // Registry is reusable after a disconnect
    h.registry.connect(&[ADDRESS]).await.unwrap();
    assert!(h.registry.channel("tag1").is_ok());
}

#[tokio::test]
async fn test_command_id_wraps() {
    let h = connected(1.0).await;
    assert_eq!(h.registry.next_command_id(), 1);
    for _ in 1..MAX_COMMAND_ID - 1 {
        h.registry.next_command_id();
    }
    assert_eq!(h.registry.next_command_id(), MAX_COMMAND_ID);
    assert_eq!(h.registry.next_command_id(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_command_ids_unique_across_tasks() {
    let h = connected(1.0).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let registry = Arc::clone(&h.registry);
        tasks.push(tokio::spawn(async move {
            (0..500)
                .map(|_| registry.next_command_id())
                .collect::<Vec<_>>()
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for id in task.await.unwrap() {
            assert!((1..=4000).contains(&id));
            assert!(seen.insert(id), "duplicate command id {}", id);
        }
    }
    assert_eq!(seen.len(), 4000);
}

#[tokio::test]
async fn test_interlock_flag_resets_on_connect() {
    let h = harness(config(vec![(STATUS, status_tag(1.0))]));
    h.registry.interlock_raised();
    assert!(h.registry.is_interlocked());

    h.registry.connect(&[ADDRESS]).await.unwrap();
    assert!(!h.registry.is_interlocked());
    h.registry.interlock_raised();
    h.registry.interlock_lowered();
    assert!(!h.registry.is_interlocked());
}

#[tokio::test]
async fn test_status_view_follows_detected_status_tag() {
    let h = connected(1.0).await;
    h.store.set("R_testCStatus:GicIO_Status", TagValue::Bool(true));
    let view = GisStatusView::new(h.registry.clone());
    assert_eq!(view.status_tag(), STATUS);
    assert!(view.gic_connection_status());
    assert!(view.is_simulated());
}
