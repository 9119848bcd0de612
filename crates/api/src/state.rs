use optbridge_brokers_iqoption::IqOptionBroker;
use optbridge_core::{OrderStore, ResultStore};
use std::sync::Arc;

/// Shared application state accessible by all route handlers.
pub struct AppState {
    pub broker: Arc<IqOptionBroker>,
    pub orders: Arc<dyn OrderStore>,
    pub results: Arc<dyn ResultStore>,
}

impl AppState {
    pub fn new(
        broker: Arc<IqOptionBroker>,
        orders: Arc<dyn OrderStore>,
        results: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            broker,
            orders,
            results,
        }
    }
}
