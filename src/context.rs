use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::ProgressTracker;
use crate::core::notifications::NotificationChannel;
use crate::core::remote::RemoteCommandChannel;
use crate::core::storage::ObjectStore;

/// Shared handles for one run. Cheap to clone into job tasks.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub channel: Arc<dyn RemoteCommandChannel>,
    pub store: Arc<dyn ObjectStore>,
    pub progress: ProgressTracker,
    pub notifier: Option<Arc<dyn NotificationChannel>>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        channel: Arc<dyn RemoteCommandChannel>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            channel,
            store,
            progress: ProgressTracker::new(),
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Option<Arc<dyn NotificationChannel>>) -> Self {
        self.notifier = notifier;
        self
    }
}
