//! Consulta RAG sobre el corpus documental del mercado.
//!
//! Flujo:
//!   1. Embedding de la consulta.
//!   2. Recuperación con diversidad por año (por emisor o global).
//!   3. Registro de la consulta y sus coincidencias en el grafo.
//!   4. Construcción del contexto con metadatos de fuente.
//!   5. El LLM responde citando documentos; la respuesta viaja con sus
//!      fuentes y un resumen de cobertura (documentos y años analizados).

use anyhow::{anyhow, Result};
use chrono::{Datelike, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::warn;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::chunk_store;
use crate::models::ChunkMatch;
use crate::retrieval::{self, extract_year};

/// Emisores por defecto del análisis comparativo cuando no se indican.
const DEFAULT_COMPARISON_SET: [&str; 3] = ["fama", "banpro", "bdf"];
/// Chunks recuperados por consulta simple / por emisor en comparativas.
const TOP_K_SINGLE: usize = 20;
const TOP_K_PER_ISSUER: usize = 10;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FuenteRag {
    pub document_title: String,
    pub issuer_name: String,
    pub document_type: String,
    pub document_date: String,
    pub similarity: f64,
    pub excerpt: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentoUnico {
    pub title: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub date: String,
    pub issuer: String,
    pub chunk_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaRag {
    pub total_chunks_analyzed: usize,
    pub unique_documents: Vec<DocumentoUnico>,
    pub unique_document_count: usize,
    pub years_found: Vec<String>,
    pub analysis_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RespuestaRag {
    pub answer: String,
    pub sources: Vec<FuenteRag>,
    pub metadata: MetaRag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_type: Option<String>,
}

/// Lanza una consulta RAG completa. `issuer_ids` vacío significa búsqueda
/// global; más de un emisor (o `analysisType == "comparative"`) activa la
/// recuperación por emisor.
pub async fn rag_query(
    state: &AppState,
    question: &str,
    issuer_ids: Vec<String>,
    analysis_type: Option<String>,
) -> Result<RespuestaRag> {
    let analysis = analysis_type.unwrap_or_else(|| "general".to_string());
    let comparative = analysis == "comparative" || issuer_ids.len() > 1;

    // 1) Embedding de la consulta
    let query_vec = state
        .llm
        .embed_query(question)
        .await
        .map_err(|e| anyhow!(e.to_string()))?;

    let tables = state.registry.tables(&state.graph).await;
    let current_year = Utc::now().year();

    // 2) Recuperación
    let mut relevant: Vec<ChunkMatch> = Vec::new();
    if comparative {
        let targets: Vec<String> = if issuer_ids.is_empty() {
            DEFAULT_COMPARISON_SET.iter().map(|s| s.to_string()).collect()
        } else {
            issuer_ids
        };
        for target in &targets {
            let chunks = retrieval::search_relevant_chunks(
                &state.graph,
                &tables,
                &query_vec,
                Some(target),
                TOP_K_PER_ISSUER,
                state.config.candidate_pool,
                current_year,
            )
            .await?;
            relevant.extend(chunks);
        }
    } else {
        relevant = retrieval::search_relevant_chunks(
            &state.graph,
            &tables,
            &query_vec,
            issuer_ids.first().map(|s| s.as_str()),
            TOP_K_SINGLE,
            state.config.candidate_pool,
            current_year,
        )
        .await?;
    }

    if relevant.is_empty() {
        return Ok(RespuestaRag {
            answer: "No se encontraron documentos relevantes para tu consulta. El sistema ya \
                     tiene documentos procesados, pero ninguno coincide con tu búsqueda. Por \
                     favor, intenta reformular la pregunta o especifica un emisor diferente."
                .to_string(),
            sources: Vec::new(),
            metadata: MetaRag {
                total_chunks_analyzed: 0,
                unique_documents: Vec::new(),
                unique_document_count: 0,
                years_found: Vec::new(),
                analysis_type: analysis,
            },
            warning_type: Some("no_relevant_docs".to_string()),
        });
    }

    // 3) Registrar la consulta y sus coincidencias (auditoría de uso)
    let query_id = Uuid::new_v4().to_string();
    let matches: Vec<(String, f64)> = relevant
        .iter()
        .map(|c| (c.id.clone(), c.similarity))
        .collect();
    if let Err(e) = chunk_store::log_query(&state.graph, &query_id, question, &matches).await {
        warn!("No se pudo registrar la consulta {query_id}: {e}");
    }

    // 4) Contexto y respuesta
    let context = retrieval::build_context(&relevant);
    let answer = state
        .llm
        .answer_with_context(question, &context)
        .await
        .map_err(|e| anyhow!(e.to_string()))?;

    // 5) Fuentes, documentos únicos y años cubiertos
    let sources: Vec<FuenteRag> = relevant
        .iter()
        .map(|chunk| FuenteRag {
            document_title: chunk.metadata.document_title.clone(),
            issuer_name: chunk.metadata.issuer_name.clone(),
            document_type: chunk.metadata.document_type.clone(),
            document_date: chunk.metadata.document_date.clone(),
            similarity: chunk.similarity,
            excerpt: chunk.text.chars().take(200).collect(),
        })
        .collect();

    let mut unique_docs: HashMap<&str, DocumentoUnico> = HashMap::new();
    for chunk in &relevant {
        unique_docs
            .entry(chunk.metadata.document_title.as_str())
            .and_modify(|d| d.chunk_count += 1)
            .or_insert_with(|| DocumentoUnico {
                title: chunk.metadata.document_title.clone(),
                doc_type: chunk.metadata.document_type.clone(),
                date: chunk.metadata.document_date.clone(),
                issuer: chunk.metadata.issuer_name.clone(),
                chunk_count: 1,
            });
    }

    let years: BTreeSet<i32> = relevant
        .iter()
        .filter_map(|chunk| extract_year(&chunk.metadata.document_date))
        .collect();
    let years_found: Vec<String> = years.into_iter().rev().map(|y| y.to_string()).collect();

    let unique_documents: Vec<DocumentoUnico> = unique_docs.into_values().collect();
    let unique_document_count = unique_documents.len();

    Ok(RespuestaRag {
        answer,
        sources,
        metadata: MetaRag {
            total_chunks_analyzed: relevant.len(),
            unique_documents,
            unique_document_count,
            years_found,
            analysis_type: analysis,
        },
        warning_type: None,
    })
}
