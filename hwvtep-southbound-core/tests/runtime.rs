mod common;

use common::{
    device_info, eventually, init_tracing, ls, within, FakeDeviceClient, FakeOwnership,
    FakeTransport, InMemoryStore,
};
use hwvtep_southbound_common::{FileFormat, Settings};
use hwvtep_southbound_core::{ConnectionState, SouthboundRuntime, StartPolicy};
use std::time::Duration;

const SETTINGS: &str = r#"
[general]
log_level = "debug"

[southbound]
historyCapacity = 8
historyLogThreshold = 4
transactTimeout = 500
ownershipTimeout = 500

[southbound.reconcileRetry]
maxAttempts = 1
initialIntervalMs = 10
maxIntervalMs = 10
"#;

#[tokio::test]
async fn runtime_wires_store_changes_to_devices() -> anyhow::Result<()> {
    init_tracing();
    let settings = Settings::from_content(SETTINGS, FileFormat::Toml)?;
    assert_eq!(settings.options().history_capacity, 8);

    let store = InMemoryStore::new();
    let transport = FakeTransport::new();
    let client = FakeDeviceClient::new(device_info(1));
    transport.register(&client);

    let runtime =
        SouthboundRuntime::start(&settings, FakeOwnership::new(), store.clone(), transport)?;
    within(runtime.manager().connect(
        &device_info(1),
        StartPolicy::SyncWaitSteady { timeout_ms: 2_000 },
    ))
    .await?;

    let instance = runtime
        .manager()
        .get_connection_instance(&client.identity())
        .unwrap();
    assert_eq!(instance.controller_history().capacity(), 8);

    store.controller_put(&client.identity(), vec![ls("ls0")]).await;
    assert!(eventually(Duration::from_secs(2), || client.batches().len() == 1).await);

    runtime.shutdown().await;
    runtime.shutdown().await;
    assert_eq!(instance.state(), ConnectionState::Closed);
    assert!(runtime.manager().connected_devices().is_empty());
    Ok(())
}
