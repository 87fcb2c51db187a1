//! Carga y gestión de configuración de la aplicación (Neo4j + LLM + ingesta).

use anyhow::{anyhow, Result};
use std::env;

#[derive(Clone, Debug)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Ollama,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub server_addr: String,

    pub llm_provider: LlmProvider,
    pub llm_embedding_model: String,
    pub llm_chat_model: String,
    /// Modelo para extracción estructurada y reconstrucción histórica.
    pub llm_extraction_model: String,

    /// Endpoint del servicio OCR para PDFs escaneados; sin él se salta
    /// directo al fallback de modelo de visión.
    pub ocr_service_url: Option<String>,
    pub download_timeout_secs: u64,

    /// Umbral de magnitud de activos por encima del cual se asume moneda
    /// local (NIO) cuando el documento no declara moneda. Heurística sin
    /// derivación documentada; se mantiene configurable.
    pub umbral_nio: f64,
    /// Tasa de cambio NIO→USD de respaldo cuando no hay registro remoto.
    pub tasa_cambio_fallback: f64,

    pub chunk_max_chars: usize,
    pub chunk_overlap: usize,
    pub max_documents_per_run: usize,
    /// Tope del pool de candidatos que se trae de Neo4j por búsqueda.
    pub candidate_pool: usize,

    pub registry_cache_ttl_secs: u64,
    pub metrics_cache_ttl_secs: u64,
    /// Pausa entre documentos de un mismo lote de ingesta.
    pub delay_between_docs_ms: u64,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let neo4j_uri = env::var("NEO4J_URI")
            .map_err(|_| anyhow!("Falta NEO4J_URI en el entorno"))?;
        let neo4j_user = env::var("NEO4J_USER")
            .map_err(|_| anyhow!("Falta NEO4J_USER en el entorno"))?;
        let neo4j_password = env::var("NEO4J_PASSWORD")
            .map_err(|_| anyhow!("Falta NEO4J_PASSWORD en el entorno"))?;

        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());

        let llm_provider_str =
            env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;

        let llm_embedding_model = env::var("LLM_EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let llm_chat_model =
            env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let llm_extraction_model = env::var("LLM_EXTRACTION_MODEL")
            .unwrap_or_else(|_| llm_chat_model.clone());

        Ok(Self {
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            server_addr,
            llm_provider,
            llm_embedding_model,
            llm_chat_model,
            llm_extraction_model,
            ocr_service_url: env::var("OCR_SERVICE_URL").ok(),
            download_timeout_secs: env_parse("DOWNLOAD_TIMEOUT_SECS", 30),
            umbral_nio: env_parse("UMBRAL_NIO", 1_200_000_000.0),
            tasa_cambio_fallback: env_parse("TASA_CAMBIO_FALLBACK", 36.6243),
            chunk_max_chars: env_parse("CHUNK_MAX_CHARS", 1500),
            chunk_overlap: env_parse("CHUNK_OVERLAP", 200),
            max_documents_per_run: env_parse("MAX_DOCUMENTS_PER_RUN", 10),
            candidate_pool: env_parse("CANDIDATE_POOL", 500),
            registry_cache_ttl_secs: env_parse("REGISTRY_CACHE_TTL_SECS", 300),
            metrics_cache_ttl_secs: env_parse("METRICS_CACHE_TTL_SECS", 120),
            delay_between_docs_ms: env_parse("DELAY_BETWEEN_DOCS_MS", 1000),
        })
    }
}

/// Lee una variable de entorno parseable con valor por defecto.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
