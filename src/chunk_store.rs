//! Persistencia en Neo4j: chunks, emisores, métricas y registro de
//! configuración remota.
//!
//! Los chunks se escriben por lotes acotados con una pausa corta entre
//! lotes; es un mecanismo de regulación de caudal frente al almacén, no de
//! corrección. La clave derivada `issuerId_documentId_chunk_idx` hace el
//! reprocesado idempotente por construcción (MERGE sobre el mismo id).

use anyhow::{anyhow, Result};
use neo4rs::{query, Graph};
use serde_json::Value;
use std::time::Duration;
use tracing::info;

use crate::errors::ExternalError;
use crate::models::{ChunkMetadata, ChunkRecord, DocumentoCrudo, Emisor, PuntoHistorico};
use crate::registry::RegistryTables;

/// Tamaño de lote de escritura de chunks (muy por debajo del límite
/// transaccional del almacén).
const BATCH_SIZE: usize = 100;
/// Pausa entre lotes.
const BATCH_PAUSE_MS: u64 = 100;

/// Chunk tal como se recupera del almacén para puntuación en memoria.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub id: String,
    pub chunk_index: i64,
    pub text: String,
    pub embedding: Vec<f64>,
    pub metadata: ChunkMetadata,
}

// ---------------------------------------------------------------------
// CHUNKS
// ---------------------------------------------------------------------

/// Persiste los chunks de un documento en lotes. Devuelve cuántos se
/// almacenaron.
pub async fn store_chunks(graph: &Graph, chunks: &[ChunkRecord]) -> Result<usize, ExternalError> {
    let mut total = 0usize;

    for (batch_no, batch) in chunks.chunks(BATCH_SIZE).enumerate() {
        let tx = graph
            .start_txn()
            .await
            .map_err(|e| ExternalError::Storage(e.to_string()))?;

        for chunk in batch {
            let metadata_json = serde_json::to_string(&chunk.metadata)
                .map_err(|e| ExternalError::Storage(e.to_string()))?;
            tx.run(
                query(
                    "MERGE (c:Chunk {id: $id})
                     SET c.issuer_id = $issuer_id, c.document_id = $document_id,
                         c.chunk_index = $chunk_index, c.text = $text,
                         c.embedding = $embedding, c.metadata = $metadata,
                         c.created_at = datetime()",
                )
                .param("id", chunk.storage_id())
                .param("issuer_id", chunk.issuer_id.clone())
                .param("document_id", chunk.document_id.clone())
                .param("chunk_index", chunk.chunk_index)
                .param("text", chunk.text.clone())
                .param("embedding", chunk.embedding.clone())
                .param("metadata", metadata_json),
            )
            .await
            .map_err(|e| ExternalError::Storage(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| ExternalError::Storage(e.to_string()))?;
        total += batch.len();
        info!(
            "Lote {} almacenado: {} chunks ({}/{} en total)",
            batch_no + 1,
            batch.len(),
            total,
            chunks.len()
        );

        if total < chunks.len() {
            tokio::time::sleep(Duration::from_millis(BATCH_PAUSE_MS)).await;
        }
    }

    Ok(total)
}

/// Trae el pool de candidatos, filtrado por ids de emisor si se indican,
/// más recientes primero y acotado por `cap` (control de coste).
pub async fn fetch_candidates(
    graph: &Graph,
    issuer_ids: Option<&[String]>,
    cap: usize,
) -> Result<Vec<StoredChunk>> {
    let mut cursor = match issuer_ids {
        Some(ids) => {
            graph
                .execute(
                    query(
                        "MATCH (c:Chunk) WHERE c.issuer_id IN $ids
                         RETURN c.id AS id, c.chunk_index AS chunk_index, c.text AS text,
                                c.embedding AS embedding, c.metadata AS metadata
                         ORDER BY c.created_at DESC LIMIT $cap",
                    )
                    .param("ids", ids.to_vec())
                    .param("cap", cap as i64),
                )
                .await?
        }
        None => {
            graph
                .execute(
                    query(
                        "MATCH (c:Chunk)
                         RETURN c.id AS id, c.chunk_index AS chunk_index, c.text AS text,
                                c.embedding AS embedding, c.metadata AS metadata
                         ORDER BY c.created_at DESC LIMIT $cap",
                    )
                    .param("cap", cap as i64),
                )
                .await?
        }
    };

    let mut chunks = Vec::new();
    while let Some(row) = cursor.next().await? {
        let id: String = row
            .get("id")
            .ok_or_else(|| anyhow!("Falta campo 'id' en resultado de Neo4j"))?;
        let chunk_index: i64 = row.get("chunk_index").unwrap_or(0);
        let text: String = row.get("text").unwrap_or_default();
        let embedding: Vec<f64> = row.get("embedding").unwrap_or_default();
        let metadata: ChunkMetadata = row
            .get::<String>("metadata")
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        chunks.push(StoredChunk {
            id,
            chunk_index,
            text,
            embedding,
            metadata,
        });
    }

    Ok(chunks)
}

/// Número total de chunks del corpus (para distinguir "aún indexando" de
/// "sin resultados").
pub async fn corpus_chunk_count(graph: &Graph) -> Result<i64> {
    let mut cursor = graph
        .execute(query("MATCH (c:Chunk) RETURN count(c) AS n"))
        .await?;
    match cursor.next().await? {
        Some(row) => Ok(row.get::<i64>("n").unwrap_or(0)),
        None => Ok(0),
    }
}

/// Primer id técnico del emisor que tiene chunks almacenados.
pub async fn first_source_with_chunks(
    graph: &Graph,
    candidate_ids: &[String],
) -> Result<Option<String>> {
    for candidate in candidate_ids {
        let mut cursor = graph
            .execute(
                query("MATCH (c:Chunk {issuer_id: $id}) RETURN c.id AS id LIMIT 1")
                    .param("id", candidate.clone()),
            )
            .await?;
        if cursor.next().await?.is_some() {
            return Ok(Some(candidate.clone()));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------
// EMISORES Y DOCUMENTOS PROCESADOS
// ---------------------------------------------------------------------

pub async fn upsert_issuer(graph: &Graph, issuer: &Emisor) -> Result<()> {
    let documents_json = serde_json::to_string(&issuer.documents)?;
    graph
        .run(
            query(
                "MERGE (e:Emisor {id: $id})
                 SET e.name = $name, e.acronym = $acronym, e.sector = $sector,
                     e.description = $description, e.detail_url = $detail_url,
                     e.is_active = $is_active, e.documents_processed = $documents_processed,
                     e.last_processed = $last_processed, e.documents = $documents",
            )
            .param("id", issuer.id.clone())
            .param("name", issuer.name.clone())
            .param("acronym", issuer.acronym.clone())
            .param("sector", issuer.sector.clone())
            .param("description", issuer.description.clone())
            .param("detail_url", issuer.detail_url.clone().unwrap_or_default())
            .param("is_active", issuer.is_active)
            .param("documents_processed", issuer.documents_processed)
            .param(
                "last_processed",
                issuer
                    .last_processed
                    .map(|d| d.to_rfc3339())
                    .unwrap_or_default(),
            )
            .param("documents", documents_json),
        )
        .await?;
    Ok(())
}

pub async fn get_issuer(graph: &Graph, issuer_id: &str) -> Result<Option<Emisor>> {
    let mut cursor = graph
        .execute(
            query(
                "MATCH (e:Emisor {id: $id})
                 RETURN e.id AS id, e.name AS name, e.acronym AS acronym,
                        e.sector AS sector, e.description AS description,
                        e.detail_url AS detail_url, e.is_active AS is_active,
                        e.documents_processed AS documents_processed,
                        e.last_processed AS last_processed, e.documents AS documents",
            )
            .param("id", issuer_id.to_string()),
        )
        .await?;

    match cursor.next().await? {
        Some(row) => Ok(Some(issuer_from_row(&row)?)),
        None => Ok(None),
    }
}

pub async fn list_issuers(graph: &Graph) -> Result<Vec<Emisor>> {
    let mut cursor = graph
        .execute(query(
            "MATCH (e:Emisor)
             RETURN e.id AS id, e.name AS name, e.acronym AS acronym,
                    e.sector AS sector, e.description AS description,
                    e.detail_url AS detail_url, e.is_active AS is_active,
                    e.documents_processed AS documents_processed,
                    e.last_processed AS last_processed, e.documents AS documents
             ORDER BY e.id",
        ))
        .await?;

    let mut issuers = Vec::new();
    while let Some(row) = cursor.next().await? {
        issuers.push(issuer_from_row(&row)?);
    }
    Ok(issuers)
}

fn issuer_from_row(row: &neo4rs::Row) -> Result<Emisor> {
    let documents: Vec<DocumentoCrudo> = row
        .get::<String>("documents")
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    let last_processed = row
        .get::<String>("last_processed")
        .filter(|s| !s.is_empty())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&chrono::Utc));
    let detail_url = row
        .get::<String>("detail_url")
        .filter(|s| !s.is_empty());

    Ok(Emisor {
        id: row
            .get("id")
            .ok_or_else(|| anyhow!("Falta campo 'id' en nodo Emisor"))?,
        name: row.get("name").unwrap_or_default(),
        acronym: row.get("acronym").unwrap_or_default(),
        sector: row.get("sector").unwrap_or_default(),
        description: row.get("description").unwrap_or_default(),
        detail_url,
        is_active: row.get("is_active").unwrap_or(true),
        documents_processed: row.get("documents_processed").unwrap_or(0),
        last_processed,
        documents,
    })
}

/// Marca un documento como procesado (deduplicación por url entre corridas).
pub async fn record_processed_document(
    graph: &Graph,
    issuer_id: &str,
    doc: &DocumentoCrudo,
    chunk_count: usize,
) -> Result<()> {
    graph
        .run(
            query(
                "MERGE (d:DocumentoProcesado {url: $url})
                 SET d.issuer_id = $issuer_id, d.title = $title,
                     d.chunk_count = $chunk_count, d.processed_at = datetime()",
            )
            .param("url", doc.url.clone())
            .param("issuer_id", issuer_id.to_string())
            .param("title", doc.title.clone())
            .param("chunk_count", chunk_count as i64),
        )
        .await?;
    Ok(())
}

pub async fn is_document_processed(graph: &Graph, url: &str) -> Result<bool> {
    let mut cursor = graph
        .execute(
            query("MATCH (d:DocumentoProcesado {url: $url}) RETURN d.url AS url LIMIT 1")
                .param("url", url.to_string()),
        )
        .await?;
    Ok(cursor.next().await?.is_some())
}

// ---------------------------------------------------------------------
// MÉTRICAS
// ---------------------------------------------------------------------

pub async fn save_metric_snapshot(graph: &Graph, issuer_id: &str, snapshot: &Value) -> Result<()> {
    graph
        .run(
            query(
                "MERGE (m:MetricSnapshot {issuer_id: $issuer_id})
                 SET m.data = $data, m.extracted_at = datetime()",
            )
            .param("issuer_id", issuer_id.to_string())
            .param("data", snapshot.to_string()),
        )
        .await?;
    Ok(())
}

pub async fn load_metric_snapshot(graph: &Graph, issuer_id: &str) -> Result<Option<Value>> {
    let mut cursor = graph
        .execute(
            query("MATCH (m:MetricSnapshot {issuer_id: $issuer_id}) RETURN m.data AS data")
                .param("issuer_id", issuer_id.to_string()),
        )
        .await?;
    match cursor.next().await? {
        Some(row) => Ok(row
            .get::<String>("data")
            .and_then(|raw| serde_json::from_str(&raw).ok())),
        None => Ok(None),
    }
}

/// Sub-registro inmutable por período fiscal (pista de auditoría).
pub async fn save_metric_period(
    graph: &Graph,
    issuer_id: &str,
    period: &str,
    snapshot: &Value,
) -> Result<()> {
    let period_key: String = period
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    graph
        .run(
            query(
                "MERGE (p:MetricPeriod {issuer_id: $issuer_id, period: $period})
                 SET p.data = $data, p.saved_at = datetime()",
            )
            .param("issuer_id", issuer_id.to_string())
            .param("period", period_key)
            .param("data", snapshot.to_string()),
        )
        .await?;
    Ok(())
}

pub async fn save_history_points(
    graph: &Graph,
    issuer_id: &str,
    points: &[PuntoHistorico],
) -> Result<()> {
    let tx = graph.start_txn().await?;
    for point in points {
        tx.run(
            query(
                "MERGE (h:HistoryPoint {issuer_id: $issuer_id, period: $period})
                 SET h.data = $data, h.extracted_at = datetime()",
            )
            .param("issuer_id", issuer_id.to_string())
            .param("period", point.period.clone())
            .param("data", serde_json::to_string(point)?),
        )
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn load_history(graph: &Graph, issuer_id: &str) -> Result<Vec<PuntoHistorico>> {
    let mut cursor = graph
        .execute(
            query(
                "MATCH (h:HistoryPoint {issuer_id: $issuer_id})
                 RETURN h.data AS data ORDER BY h.period ASC",
            )
            .param("issuer_id", issuer_id.to_string()),
        )
        .await?;

    let mut points = Vec::new();
    while let Some(row) = cursor.next().await? {
        if let Some(point) = row
            .get::<String>("data")
            .and_then(|raw| serde_json::from_str(&raw).ok())
        {
            points.push(point);
        }
    }
    Ok(points)
}

/// Registra la consulta RAG y sus chunks coincidentes (auditoría de uso).
pub async fn log_query(
    graph: &Graph,
    query_id: &str,
    question: &str,
    matches: &[(String, f64)],
) -> Result<()> {
    graph
        .run(
            query(
                "MERGE (q:Consulta {id: $id})
                 SET q.question = $question, q.created_at = datetime()",
            )
            .param("id", query_id.to_string())
            .param("question", question.to_string()),
        )
        .await?;

    for (chunk_id, score) in matches {
        graph
            .run(
                query(
                    "MATCH (q:Consulta {id: $qid}), (c:Chunk {id: $cid})
                     MERGE (q)-[r:MATCHED_CHUNK]->(c) SET r.score = $score",
                )
                .param("qid", query_id.to_string())
                .param("cid", chunk_id.clone())
                .param("score", *score),
            )
            .await?;
    }

    Ok(())
}

// ---------------------------------------------------------------------
// REGISTRO DE CONFIGURACIÓN REMOTA
// ---------------------------------------------------------------------

pub async fn load_registry_tables(graph: &Graph) -> Result<Option<RegistryTables>> {
    let mut cursor = graph
        .execute(query(
            "MATCH (s:SystemConfig {id: 'issuers'}) RETURN s.data AS data",
        ))
        .await?;
    match cursor.next().await? {
        Some(row) => Ok(row
            .get::<String>("data")
            .and_then(|raw| serde_json::from_str(&raw).ok())),
        None => Ok(None),
    }
}

pub async fn save_registry_tables(graph: &Graph, tables: &RegistryTables) -> Result<()> {
    graph
        .run(
            query(
                "MERGE (s:SystemConfig {id: 'issuers'})
                 SET s.data = $data, s.updated_at = datetime()",
            )
            .param("data", serde_json::to_string(tables)?),
        )
        .await?;
    Ok(())
}

/// Tasa de cambio NIO→USD del registro de mercado, si existe.
pub async fn load_exchange_rate(graph: &Graph) -> Result<Option<f64>> {
    let mut cursor = graph
        .execute(query(
            "MATCH (s:SystemConfig {id: 'market'}) RETURN s.exchange_rate AS rate",
        ))
        .await?;
    match cursor.next().await? {
        Some(row) => Ok(row.get::<f64>("rate")),
        None => Ok(None),
    }
}
