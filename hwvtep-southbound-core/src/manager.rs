use crate::{
    instance::{ConnectionState, DeviceConnectionInstance},
    invoker::InvokerState,
    lifecycle::{start_with_policy, StartPolicy},
};
use backoff::backoff::Backoff;
use dashmap::DashMap;
use futures::future::join_all;
use hwvtep_southbound_error::{SouthboundError, SouthboundResult};
use hwvtep_southbound_sdk::{
    build_exponential_backoff, ConnectionInfo, DataStore, DeviceClient, DeviceIdentity,
    DeviceTransport, OwnershipDecision, OwnershipService, SouthboundOptions,
};
use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};
use tokio::{task::JoinHandle, time};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, instrument, warn};

/// Registry of live device connections owned by this process.
///
/// At most one instance per [`DeviceIdentity`] is registered. Transports for
/// devices owned elsewhere are parked in a pending map until ownership is
/// granted, or dropped when they go inactive.
pub struct ConnectionManager {
    ownership: Arc<dyn OwnershipService>,
    store: Arc<dyn DataStore>,
    transport: Arc<dyn DeviceTransport>,
    options: Arc<SouthboundOptions>,
    instances: DashMap<DeviceIdentity, Arc<DeviceConnectionInstance>>,
    pending: DashMap<DeviceIdentity, Arc<dyn DeviceClient>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        ownership: Arc<dyn OwnershipService>,
        store: Arc<dyn DataStore>,
        transport: Arc<dyn DeviceTransport>,
        options: SouthboundOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            ownership,
            store,
            transport,
            options: Arc::new(options),
            instances: DashMap::new(),
            pending: DashMap::new(),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            listener: Mutex::new(None),
        })
    }

    #[inline]
    pub fn options(&self) -> &SouthboundOptions {
        &self.options
    }

    #[inline]
    pub fn store(&self) -> Arc<dyn DataStore> {
        Arc::clone(&self.store)
    }

    /// Start listening for ownership grants and revocations.
    pub fn start(self: &Arc<Self>) -> SouthboundResult<()> {
        let mut listener = self.listener.lock().unwrap();
        if listener.is_some() {
            return Err(SouthboundError::InvalidState(
                "connection manager already started".into(),
            ));
        }
        let mut changes = self.ownership.subscribe();
        let manager = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        *listener = Some(tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    change = changes.recv() => match change {
                        Some(change) => change,
                        None => break,
                    },
                };
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager
                    .on_ownership_changed(&change.device, change.owned)
                    .await;
            }
            debug!("Ownership listener exited");
        }));
        Ok(())
    }

    /// Open a transport to `info` and bring the connection up.
    pub async fn connect(
        self: &Arc<Self>,
        info: &ConnectionInfo,
        policy: StartPolicy,
    ) -> SouthboundResult<()> {
        let client = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SouthboundError::closed("connection manager shut down")),
            client = self.transport.connect(info) => client?,
        };
        self.on_connected(client, policy).await
    }

    /// A transport to a device is up. Replaces any stale connection for the
    /// same device, then requests ownership.
    #[instrument(name = "on-connected", skip_all, fields(device = %client.connection_info().identity()))]
    pub async fn on_connected(
        self: &Arc<Self>,
        client: Arc<dyn DeviceClient>,
        policy: StartPolicy,
    ) -> SouthboundResult<()> {
        let device = client.connection_info().identity();

        if let Some((_, stale)) = self.instances.remove(&device) {
            info!("Replacing stale connection");
            stale.close("replaced by a new connection", true).await;
        }
        if let Some((_, parked)) = self.pending.remove(&device) {
            if !Arc::ptr_eq(&parked, &client) {
                parked.disconnect().await;
            }
        }

        // Parked while the request is out, so a grant that overtakes the
        // answer finds the transport.
        self.pending.insert(device.clone(), Arc::clone(&client));
        let decision = self.request_ownership(&device).await;
        let still_parked = |parked: &Arc<dyn DeviceClient>| Arc::ptr_eq(parked, &client);

        match decision {
            Err(e) => {
                warn!(error = %e, "Ownership request failed, dropping transport");
                self.pending.remove_if(&device, |_, parked| still_parked(parked));
                client.disconnect().await;
                Err(e)
            }
            Ok(OwnershipDecision::Granted) => {
                if self
                    .pending
                    .remove_if(&device, |_, parked| still_parked(parked))
                    .is_some()
                {
                    return self.activate_owned(device, client, policy).await;
                }
                debug!("Transport already promoted by an ownership change");
                self.wait_promoted(&device, policy).await
            }
            Ok(OwnershipDecision::Denied) => {
                if self.pending.view(&device, |_, parked| still_parked(parked)) == Some(true) {
                    info!("Device owned elsewhere, holding transport");
                } else {
                    debug!("Ownership granted before the denial arrived");
                }
                Ok(())
            }
        }
    }

    /// Connect-side wait for a transport the ownership listener activated.
    async fn wait_promoted(
        &self,
        device: &DeviceIdentity,
        policy: StartPolicy,
    ) -> SouthboundResult<()> {
        match (policy, self.get_connection_instance(device)) {
            (StartPolicy::SyncWaitSteady { timeout_ms }, Some(instance)) => {
                instance
                    .wait_for_state(ConnectionState::Steady, Duration::from_millis(timeout_ms))
                    .await
            }
            _ => Ok(()),
        }
    }

    async fn request_ownership(&self, device: &DeviceIdentity) -> SouthboundResult<OwnershipDecision> {
        let limit = self.options.ownership_timeout();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SouthboundError::closed("connection manager shut down")),
            res = time::timeout(limit, self.ownership.request_ownership(device)) => {
                res.map_err(|_| SouthboundError::Timeout(limit))?
            }
        }
    }

    async fn activate_owned(
        self: &Arc<Self>,
        device: DeviceIdentity,
        client: Arc<dyn DeviceClient>,
        policy: StartPolicy,
    ) -> SouthboundResult<()> {
        let instance = DeviceConnectionInstance::new(
            device.clone(),
            client,
            Arc::clone(&self.options),
            &self.cancel,
        );
        self.instances.insert(device, Arc::clone(&instance));

        let manager = Arc::clone(self);
        let lifecycle_instance = Arc::clone(&instance);
        start_with_policy(
            policy,
            &self.tracker,
            move || async move { manager.run_lifecycle(lifecycle_instance).await },
            |timeout_ms| {
                instance.wait_for_state(ConnectionState::Steady, Duration::from_millis(timeout_ms))
            },
        )
        .await
    }

    /// Activate, start the monitors, then run first-update reconciliation
    /// with bounded backoff. Gives up leaving the instance unavailable for
    /// writes until a reconnect or a fresh ownership grant.
    async fn run_lifecycle(
        self: Arc<Self>,
        instance: Arc<DeviceConnectionInstance>,
    ) -> SouthboundResult<()> {
        let device = instance.device().clone();
        if let Err(e) = instance.activate().await {
            error!(%device, error = %e, "Device activation failed");
            self.deregister(&instance, "activation failed", true).await;
            return Err(e);
        }
        self.spawn_update_pump(&instance);
        self.spawn_invoker_supervisor(&instance);

        let policy = self.options.reconcile_retry;
        let mut backoff = build_exponential_backoff(&policy);
        let mut retries = 0u32;
        loop {
            let err = match instance.reconcile_first(self.store.as_ref()).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if instance.is_closed() {
                return Err(err);
            }
            let delay = if policy.allows_retry(retries) {
                backoff.next_backoff()
            } else {
                None
            };
            let Some(delay) = delay else {
                error!(
                    %device,
                    retries,
                    error = %err,
                    "Giving up on first-update reconciliation, device stays unavailable"
                );
                return Err(SouthboundError::Reconciliation(format!(
                    "{device}: gave up after {retries} retries: {err}"
                )));
            };
            retries += 1;
            debug!(%device, retry = retries, ?delay, "Retrying first-update reconciliation");
            let cancel = instance.cancel_token();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SouthboundError::closed(format!("{device} closed"))),
                _ = time::sleep(delay) => {}
            }
        }
    }

    fn spawn_update_pump(self: &Arc<Self>, instance: &Arc<DeviceConnectionInstance>) {
        let Some(mut updates) = instance.client().take_updates() else {
            debug!(device = %instance.device(), "Device reports no update stream");
            return;
        };
        let manager = Arc::downgrade(self);
        let store = Arc::clone(&self.store);
        let instance = Arc::clone(instance);
        let cancel = instance.cancel_token();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    update = updates.recv() => match update {
                        Some(update) => {
                            if let Err(e) = instance.apply_device_update(update, store.as_ref()).await {
                                warn!(device = %instance.device(), error = %e, "Failed to apply device update");
                            }
                        }
                        None => {
                            if !instance.is_closed() {
                                transport_lost(&manager, &instance, "device update stream ended").await;
                            }
                            break;
                        }
                    },
                }
            }
        });
    }

    fn spawn_invoker_supervisor(self: &Arc<Self>, instance: &Arc<DeviceConnectionInstance>) {
        let Some(invoker) = instance.invoker() else {
            return;
        };
        let mut state = invoker.subscribe_state();
        let manager = Arc::downgrade(self);
        let instance = Arc::clone(instance);
        self.tracker.spawn(async move {
            let ended = state
                .wait_for(|s| *s != InvokerState::Running)
                .await
                .map(|s| *s)
                .unwrap_or(InvokerState::Stopped);
            if ended == InvokerState::Failed && !instance.is_closed() {
                transport_lost(&manager, &instance, "transaction invoker failed").await;
            }
        });
    }

    /// Grant promotes a parked transport; revocation deregisters first, then
    /// closes, keeping the transport for hand-off while it is still active.
    #[instrument(name = "ownership-changed", skip(self), fields(device = %device))]
    pub async fn on_ownership_changed(self: &Arc<Self>, device: &DeviceIdentity, owned: bool) {
        if owned {
            let Some((_, client)) = self.pending.remove(device) else {
                debug!("Ownership granted with no parked transport");
                return;
            };
            if !client.is_active() {
                info!("Parked transport is gone, releasing ownership");
                client.disconnect().await;
                self.release(device).await;
                return;
            }
            info!("Ownership granted, activating parked transport");
            if let Err(e) = self
                .activate_owned(device.clone(), client, StartPolicy::AsyncFireAndForget)
                .await
            {
                warn!(error = %e, "Failed to start connection after grant");
            }
            return;
        }

        let Some((_, instance)) = self.instances.remove(device) else {
            return;
        };
        info!("Ownership revoked, closing connection");
        let client = instance.client();
        instance.close("ownership revoked", false).await;
        if client.is_active() {
            self.pending.insert(device.clone(), client);
        } else {
            client.disconnect().await;
        }
    }

    /// The transport to `device` is gone.
    pub async fn on_disconnected(&self, device: &DeviceIdentity) {
        if let Some((_, instance)) = self.instances.remove(device) {
            instance.close("device disconnected", true).await;
            self.release(device).await;
        }
        if let Some((_, client)) = self.pending.remove(device) {
            client.disconnect().await;
        }
    }

    /// Live instance for `device`, if this process owns it and it is not closing.
    pub fn get_connection_instance(
        &self,
        device: &DeviceIdentity,
    ) -> Option<Arc<DeviceConnectionInstance>> {
        self.instances
            .get(device)
            .map(|e| Arc::clone(e.value()))
            .filter(|i| !i.is_closed())
    }

    pub fn connected_devices(&self) -> Vec<DeviceIdentity> {
        self.instances
            .iter()
            .filter(|e| !e.value().is_closed())
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn pending_devices(&self) -> Vec<DeviceIdentity> {
        self.pending.iter().map(|e| e.key().clone()).collect()
    }

    /// Remove `instance` if it is still the registered one, close it and give
    /// up ownership.
    async fn deregister(
        &self,
        instance: &Arc<DeviceConnectionInstance>,
        reason: &str,
        disconnect_transport: bool,
    ) {
        let device = instance.device();
        let removed = self
            .instances
            .remove_if(device, |_, registered| Arc::ptr_eq(registered, instance))
            .is_some();
        instance.close(reason, disconnect_transport).await;
        if removed {
            self.release(device).await;
        }
    }

    async fn release(&self, device: &DeviceIdentity) {
        if let Err(e) = self.ownership.release_ownership(device).await {
            warn!(%device, error = %e, "Failed to release ownership");
        }
    }

    /// Close every connection, release ownerships and wait for background tasks.
    pub async fn shutdown(&self) {
        info!("Shutting down connection manager");
        self.cancel.cancel();
        let listener = self.listener.lock().unwrap().take();
        if let Some(listener) = listener {
            let _ = listener.await;
        }

        let devices: Vec<DeviceIdentity> = self.instances.iter().map(|e| e.key().clone()).collect();
        let owned: Vec<_> = devices
            .iter()
            .filter_map(|device| self.instances.remove(device))
            .collect();
        join_all(owned.iter().map(|(device, instance)| async move {
            instance.close("shutdown", true).await;
            self.release(device).await;
        }))
        .await;
        let parked: Vec<DeviceIdentity> = self.pending.iter().map(|e| e.key().clone()).collect();
        for device in parked {
            if let Some((_, client)) = self.pending.remove(&device) {
                client.disconnect().await;
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("Connection manager shut down");
    }
}

async fn transport_lost(
    manager: &Weak<ConnectionManager>,
    instance: &Arc<DeviceConnectionInstance>,
    reason: &str,
) {
    warn!(device = %instance.device(), reason, "Device transport lost");
    match manager.upgrade() {
        Some(manager) => manager.deregister(instance, reason, true).await,
        None => instance.close(reason, true).await,
    }
}
