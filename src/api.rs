//! Superficie HTTP del servicio (axum). La autenticación y el frontend
//! quedan fuera: aquí sólo viven los handlers finos sobre el núcleo.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::spawn;
use tracing::{error, info};

use crate::{
    app_state::{AppState, Status},
    chunk_store, ingest,
    metrics,
    models::{DocumentoCrudo, Emisor},
    rag,
    registry::{self, RegistryTables},
};

// --- Payloads de la API ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiQueryPayload {
    query: String,
    /// Un id ("banpro"), una lista (["banpro", "bdf"]) o ausente.
    #[serde(default)]
    issuer_id: Option<Value>,
    #[serde(default)]
    analysis_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparePayload {
    issuer_ids: Vec<String>,
}

/// Emisor crudo tal como lo entregan los scrapers externos.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawIssuerPayload {
    name: String,
    #[serde(default)]
    sector: String,
    #[serde(default)]
    detail_url: Option<String>,
    #[serde(default)]
    documents: Vec<DocumentoCrudo>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/issuers", get(list_issuers_handler))
        .route("/api/issuer/:id", get(get_issuer_handler))
        .route("/api/issuer/:id/documents", post(add_documents_handler))
        .route("/api/issuers/sync", post(sync_issuers_handler))
        .route("/api/seed", post(seed_handler))
        .route("/api/process/:id", post(process_handler))
        .route("/api/status", get(status_handler))
        .route("/api/ai/query", post(ai_query_handler))
        .route("/api/metrics/extract/:id", post(extract_metrics_handler))
        .route("/api/metrics/compare", post(compare_metrics_handler))
        .route(
            "/api/metrics/history/extract/:id",
            post(extract_history_handler),
        )
        .route("/api/metrics/history/:id", get(get_history_handler))
        .route("/api/metrics/:id", get(get_metrics_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

type ApiError = (StatusCode, Json<Value>);

fn internal_error(context: &str, e: impl std::fmt::Display) -> ApiError {
    error!("{context}: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": format!("{context}: {e}")})),
    )
}

// --- Handlers de emisores ---

#[axum::debug_handler]
async fn list_issuers_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<Emisor>>, ApiError> {
    let issuers = chunk_store::list_issuers(&state.graph)
        .await
        .map_err(|e| internal_error("Error consultando emisores", e))?;
    Ok(Json(issuers))
}

#[axum::debug_handler]
async fn get_issuer_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Emisor>, ApiError> {
    let issuer = chunk_store::get_issuer(&state.graph, &id)
        .await
        .map_err(|e| internal_error("Error consultando el emisor", e))?;
    match issuer {
        Some(issuer) => Ok(Json(issuer)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Emisor no encontrado"})),
        )),
    }
}

/// Adjunta listados crudos de documentos a un emisor (deduplicados por
/// url). Es la puerta por la que entran los resultados de los scrapers
/// externos.
#[axum::debug_handler]
async fn add_documents_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(documents): Json<Vec<DocumentoCrudo>>,
) -> Result<Json<Value>, ApiError> {
    let issuer = chunk_store::get_issuer(&state.graph, &id)
        .await
        .map_err(|e| internal_error("Error consultando el emisor", e))?;

    let Some(mut issuer) = issuer else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Emisor no encontrado"})),
        ));
    };

    let before = issuer.documents.len();
    registry::merge_documents(&mut issuer.documents, documents);
    let added = issuer.documents.len() - before;

    chunk_store::upsert_issuer(&state.graph, &issuer)
        .await
        .map_err(|e| internal_error("Error guardando el emisor", e))?;

    Ok(Json(json!({
        "issuerId": issuer.id,
        "documentsAdded": added,
        "documentsTotal": issuer.documents.len(),
    })))
}

/// Consolida emisores crudos de scraping contra la whitelist y fusiona el
/// resultado con los registros existentes. Los nombres que no resuelven a
/// un id canónico se descartan (nunca se adivina un emisor).
#[axum::debug_handler]
async fn sync_issuers_handler(
    State(state): State<AppState>,
    Json(raw_issuers): Json<Vec<RawIssuerPayload>>,
) -> Result<Json<Value>, ApiError> {
    let tables = state.registry.tables(&state.graph).await;

    let raw: Vec<Emisor> = raw_issuers
        .into_iter()
        .map(|r| Emisor {
            id: String::new(),
            name: r.name,
            acronym: String::new(),
            sector: r.sector,
            description: String::new(),
            detail_url: r.detail_url,
            is_active: true,
            documents_processed: 0,
            last_processed: None,
            documents: r.documents,
        })
        .collect();
    let received = raw.len();

    let consolidated = tables.consolidate(raw);
    let mut synced = 0;

    for issuer in consolidated {
        // Fusionar con el registro existente, deduplicando documentos
        let merged = match chunk_store::get_issuer(&state.graph, &issuer.id)
            .await
            .map_err(|e| internal_error("Error consultando el emisor", e))?
        {
            Some(mut existing) => {
                registry::merge_documents(&mut existing.documents, issuer.documents);
                if existing.detail_url.is_none() {
                    existing.detail_url = issuer.detail_url;
                }
                existing
            }
            None => issuer,
        };

        chunk_store::upsert_issuer(&state.graph, &merged)
            .await
            .map_err(|e| internal_error("Error guardando el emisor", e))?;
        synced += 1;
    }

    Ok(Json(json!({"received": received, "synced": synced})))
}

/// Siembra el registro de emisores desde las tablas vigentes y respalda
/// las tablas en el registro de configuración remota.
#[axum::debug_handler]
async fn seed_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let tables: RegistryTables = state.registry.tables(&state.graph).await;
    let mut seeded = 0;

    for canonical in &tables.whitelist {
        // Un seed nunca pisa un emisor ya registrado
        let exists = chunk_store::get_issuer(&state.graph, canonical)
            .await
            .map_err(|e| internal_error("Error consultando el emisor", e))?
            .is_some();
        if exists {
            continue;
        }

        let meta = tables.metadata.get(canonical);
        let issuer = Emisor {
            id: canonical.clone(),
            name: meta.map(|m| m.name.clone()).unwrap_or_else(|| canonical.clone()),
            acronym: meta
                .map(|m| m.acronym.clone())
                .unwrap_or_else(|| canonical.to_uppercase()),
            sector: meta.map(|m| m.sector.clone()).unwrap_or_default(),
            description: meta.map(|m| m.description.clone()).unwrap_or_default(),
            detail_url: None,
            is_active: true,
            documents_processed: 0,
            last_processed: None,
            documents: Vec::new(),
        };
        chunk_store::upsert_issuer(&state.graph, &issuer)
            .await
            .map_err(|e| internal_error("Error sembrando el emisor", e))?;
        seeded += 1;
    }

    if let Err(e) = chunk_store::save_registry_tables(&state.graph, &tables).await {
        error!("No se pudo respaldar las tablas del registro: {e}");
    }

    Ok(Json(json!({"seeded": seeded, "total": tables.whitelist.len()})))
}

// --- Ingesta ---

#[axum::debug_handler]
async fn process_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let issuer = chunk_store::get_issuer(&state.graph, &id)
        .await
        .map_err(|e| internal_error("Error consultando el emisor", e))?;
    if issuer.is_none() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Emisor no encontrado"})),
        ));
    }

    {
        let status = state.status.lock().unwrap();
        if status.is_busy {
            return Err((
                StatusCode::CONFLICT,
                Json(json!({"error": "Hay una ingesta en curso"})),
            ));
        }
    }

    let task_state = state.clone();
    spawn(async move {
        {
            let mut status = task_state.status.lock().unwrap();
            status.is_busy = true;
            status.message = format!("Iniciando ingesta para {id}...");
            status.progress = 0.0;
        }

        let result =
            ingest::process_issuer_documents(&task_state, &id, task_state.status.clone()).await;

        let mut status = task_state.status.lock().unwrap();
        status.is_busy = false;
        status.progress = 0.0;
        match result {
            Ok(summary) => {
                status.message = format!("¡Ingesta completada! {summary}");
            }
            Err(err) => {
                status.message = format!("Error en la ingesta: {err}");
                error!("Error de ingesta: {err}");
            }
        }
    });

    Ok(StatusCode::ACCEPTED)
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(state.status.lock().unwrap().clone())
}

// --- Consulta RAG ---

#[axum::debug_handler]
async fn ai_query_handler(
    State(state): State<AppState>,
    Json(payload): Json<AiQueryPayload>,
) -> Result<Json<rag::RespuestaRag>, ApiError> {
    if payload.query.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Query is required"})),
        ));
    }

    // 503 "aún indexando" cuando el corpus entero está vacío; distinto del
    // 200 sin resultados cuando hay chunks pero ninguno coincide.
    let corpus = chunk_store::corpus_chunk_count(&state.graph)
        .await
        .map_err(|e| internal_error("Error consultando el corpus", e))?;
    if corpus == 0 {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "service_initializing",
                "message": "El sistema de IA aún está procesando documentos. Los embeddings se \
                            están generando en este momento. Por favor intenta de nuevo más tarde.",
            })),
        ));
    }

    let issuer_ids = match payload.issuer_id {
        Some(Value::String(id)) => vec![id],
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        _ => Vec::new(),
    };

    let response = rag::rag_query(&state, &payload.query, issuer_ids, payload.analysis_type)
        .await
        .map_err(|e| internal_error("Error al procesar la consulta RAG", e))?;

    Ok(Json(response))
}

// --- Métricas ---

#[axum::debug_handler]
async fn extract_metrics_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let issuer = chunk_store::get_issuer(&state.graph, &id)
        .await
        .map_err(|e| internal_error("Error consultando el emisor", e))?;
    if issuer.is_none() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Emisor no encontrado"})),
        ));
    }

    let extracted = metrics::extract_issuer_metrics(&state, &id)
        .await
        .map_err(|e| internal_error("Error extrayendo métricas", e))?;

    info!("Métricas extraídas vía API para {id}");
    Ok(Json(json!({"success": true, "metrics": extracted})))
}

#[axum::debug_handler]
async fn get_metrics_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let snapshot = metrics::get_issuer_metrics(&state, &id)
        .await
        .map_err(|e| internal_error("Error consultando métricas", e))?;
    match snapshot {
        Some(metrics) => Ok(Json(json!({"success": true, "metrics": metrics}))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Métricas no encontradas"})),
        )),
    }
}

#[axum::debug_handler]
async fn compare_metrics_handler(
    State(state): State<AppState>,
    Json(payload): Json<ComparePayload>,
) -> Result<Json<Value>, ApiError> {
    if payload.issuer_ids.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "issuerIds array is required"})),
        ));
    }

    let comparison = metrics::compare_issuer_metrics(&state, &payload.issuer_ids)
        .await
        .map_err(|e| internal_error("Error comparando métricas", e))?;
    Ok(Json(json!(comparison)))
}

#[axum::debug_handler]
async fn extract_history_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let history = metrics::extract_historical_metrics(&state, &id)
        .await
        .map_err(|e| internal_error("Error extrayendo la serie histórica", e))?;
    Ok(Json(json!({"success": true, "history": history})))
}

#[axum::debug_handler]
async fn get_history_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let history = metrics::get_issuer_history(&state, &id)
        .await
        .map_err(|e| internal_error("Error consultando la serie histórica", e))?;
    Ok(Json(json!(history)))
}

// --- Apagado ---

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    if let Some(sender) = state.shutdown_sender.lock().unwrap().take() {
        let _ = sender.send(());
    }
    StatusCode::OK
}
