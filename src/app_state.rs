use neo4rs::Graph;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::{
    cache::CacheService, config::AppConfig, llm::LlmManager, registry::RegistryHandle,
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub graph: Arc<Graph>,
    pub llm: LlmManager,
    /// Cliente HTTP compartido (descargas y OCR) con timeout acotado.
    pub http: reqwest::Client,
    pub registry: RegistryHandle,
    pub cache: CacheService,
    pub status: Arc<Mutex<Status>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub progress: f32, // Valor entre 0.0 y 1.0
}
