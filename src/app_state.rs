use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use crate::{catalog::DocumentSource, config::AppConfig, session::SessionStore};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub catalog: Arc<dyn DocumentSource>,
    pub sessions: SessionStore,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        catalog: Arc<dyn DocumentSource>,
        shutdown_sender: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            config,
            catalog,
            sessions: SessionStore::new(),
            shutdown_sender: Arc::new(Mutex::new(shutdown_sender)),
        }
    }
}
