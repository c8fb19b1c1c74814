//! `AppContext`: the single bundle of shared handles threaded through every
//! component, replacing any process-wide mutable statics (§9).

use conductor_core::Config;
use std::sync::Arc;

use crate::broadcast::BroadcastHook;
use crate::mailbus::MailBus;
use crate::store::Store;
use crate::supervisor::ProcessSupervisor;

/// Cheaply cloneable: every field is itself an `Arc` or wraps one.
#[derive(Clone)]
pub struct AppContext {
    pub store: Store,
    pub mail: MailBus,
    pub config: Arc<Config>,
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub broadcast: Arc<dyn BroadcastHook>,
}

impl AppContext {
    #[must_use]
    pub fn new(
        store: Store,
        config: Config,
        supervisor: Arc<dyn ProcessSupervisor>,
        broadcast: Arc<dyn BroadcastHook>,
    ) -> Self {
        let mail = MailBus::new(store.clone());
        Self {
            store,
            mail,
            config: Arc::new(config),
            supervisor,
            broadcast,
        }
    }
}
