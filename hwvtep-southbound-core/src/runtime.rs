use crate::{manager::ConnectionManager, reconciler::DataChangeReconciler};
use hwvtep_southbound_common::Settings;
use hwvtep_southbound_error::SouthboundResult;
use hwvtep_southbound_sdk::{DataStore, DeviceTransport, OwnershipService};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::info;

/// The assembled southbound core: one connection manager plus the change
/// reconciler feeding it, started and stopped together.
pub struct SouthboundRuntime {
    manager: Arc<ConnectionManager>,
    reconciler: Arc<DataChangeReconciler>,
    shutting_down: AtomicBool,
}

impl SouthboundRuntime {
    pub fn start(
        settings: &Settings,
        ownership: Arc<dyn OwnershipService>,
        store: Arc<dyn DataStore>,
        transport: Arc<dyn DeviceTransport>,
    ) -> SouthboundResult<Self> {
        let manager = ConnectionManager::new(
            ownership,
            Arc::clone(&store),
            transport,
            settings.options().clone(),
        );
        manager.start()?;
        let reconciler = DataChangeReconciler::new(Arc::clone(&manager), store);
        reconciler.start()?;
        info!(
            history_capacity = settings.options().history_capacity,
            transact_timeout_ms = settings.options().transact_timeout,
            "Southbound runtime started"
        );
        Ok(Self {
            manager,
            reconciler,
            shutting_down: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    #[inline]
    pub fn reconciler(&self) -> &Arc<DataChangeReconciler> {
        &self.reconciler
    }

    /// Stop intake first, then tear connections down. Repeated calls are no-ops.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reconciler.stop().await;
        self.manager.shutdown().await;
        info!("Southbound runtime stopped");
    }
}
