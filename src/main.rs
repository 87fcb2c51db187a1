// Módulos de la aplicación
mod api;
mod app_state;
mod cache;
mod chunk_store;
mod config;
mod errors;
mod ingest;
mod llm;
mod metrics;
mod models;
mod neo4j_client;
mod ocr;
mod rag;
mod registry;
mod retrieval;

use crate::app_state::{AppState, Status};
use crate::cache::{CacheService, SystemClock};
use crate::registry::RegistryHandle;
use axum::Router;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().expect("Error al cargar la configuración");

    // 3. Conectar a Neo4j y asegurar esquemas
    let graph = neo4j_client::connect_from_config(&cfg)
        .await
        .expect("Error conectando a Neo4j");
    neo4j_client::ensure_schema(&graph)
        .await
        .expect("Error asegurando el esquema de Neo4j");

    // 4. Inicializar gestor de LLMs y cliente HTTP con timeout acotado
    let llm = llm::LlmManager::from_config(&cfg).expect("Error inicializando LLM Manager");
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.download_timeout_secs))
        .build()
        .expect("Error construyendo el cliente HTTP");

    // 5. Caché volátil y registro de emisores (TTL + respaldo estático)
    let clock = Arc::new(SystemClock);
    let cache = CacheService::new(clock.clone());
    let registry = RegistryHandle::new(clock, cfg.registry_cache_ttl_secs);

    // Canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 6. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        graph: Arc::new(graph),
        llm,
        http,
        registry,
        cache,
        status: Arc::new(Mutex::new(Status {
            is_busy: false,
            message: "Servidor listo.".to_string(),
            progress: 0.0,
        })),
        shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    // 7. Configurar el router de la API
    let app = Router::new()
        .merge(api::create_router(app_state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 8. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .unwrap();
    info!("🚀 Servidor escuchando en http://{}", server_addr);

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await
        .unwrap();

    info!("✅ Servidor cerrado correctamente.");
}
