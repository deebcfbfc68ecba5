use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::config::AppConfig;
use crate::qr::QrRegistry;
use crate::verification::DecisionStore;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub config: AppConfig,
    pub qr: QrRegistry,
    pub decisions: DecisionStore,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let qr = QrRegistry::new(config.qr_secret.clone());
        Self {
            workspace: None,
            db: None,
            config,
            qr,
            decisions: DecisionStore::default(),
        }
    }
}
