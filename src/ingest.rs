//! Ingesta de documentos regulatorios: descarga, extracción de texto (con
//! OCR de respaldo), clasificación, extracción estructurada condicional,
//! chunking con solape y embeddings, persistiendo los chunks en Neo4j.
//!
//! Cada etapa puede fallar de forma independiente: un documento ilegible
//! degrada su contribución a cero chunks pero nunca detiene el resto del
//! lote. El procesamiento dentro de un emisor es secuencial, con pausas
//! fijas, para respetar las cuotas de los servicios de embeddings y
//! generación.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Utc};
use reqwest::header::USER_AGENT;
use tracing::{error, info, warn};

use crate::app_state::{AppState, Status};
use crate::chunk_store;
use crate::errors::ExternalError;
use crate::metrics;
use crate::models::{ChunkMetadata, ChunkRecord, DocumentoCrudo, SUPER_CHUNK_INDEX};
use crate::ocr;

/// Base para urls relativas de los listados.
const DOWNLOAD_BASE_URL: &str = "https://www.bolsanic.com";
/// Longitud mínima de un fragmento emitido por el chunking.
const MIN_CHUNK_CHARS: usize = 10;
/// Longitud mínima del texto extraído para seguir procesando.
const MIN_TEXT_LEN: usize = 10;

/// Resumen de los resultados de una corrida de ingesta.
#[derive(Debug, Default)]
pub struct ResumenIngesta {
    pub documents_total: usize,
    pub documents_relevant: usize,
    pub documents_processed: u32,
    pub documents_skipped: u32,
    pub chunks_created: usize,
    pub super_chunks_created: usize,
}

/// Implementa cómo se mostrará el resumen como texto.
impl std::fmt::Display for ResumenIngesta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resumen: {} documentos listados, {} relevantes, {} procesados, {} omitidos. {} chunks y {} super chunks creados.",
            self.documents_total,
            self.documents_relevant,
            self.documents_processed,
            self.documents_skipped,
            self.chunks_created,
            self.super_chunks_created
        )
    }
}

// ---------------------------------------------------------------------
// DESCARGA Y EXTRACCIÓN
// ---------------------------------------------------------------------

/// Descarga un documento PDF. Las urls relativas se resuelven contra el
/// dominio del mercado y los espacios se codifican; el timeout viene del
/// cliente HTTP compartido.
pub async fn download_document(
    http: &reqwest::Client,
    url: &str,
) -> Result<Vec<u8>, ExternalError> {
    let mut full_url = if url.starts_with("http") {
        url.to_string()
    } else {
        format!("{DOWNLOAD_BASE_URL}{url}")
    };

    if full_url.contains(' ') {
        full_url = full_url.replace(' ', "%20");
    }

    info!("Descargando documento desde: {full_url}");

    let response = http
        .get(&full_url)
        .header(
            USER_AGENT,
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
        )
        .send()
        .await
        .map_err(|e| ExternalError::Download(e.to_string()))?;

    if !response.status().is_success() {
        return Err(ExternalError::Download(format!(
            "respuesta {} para {}",
            response.status(),
            full_url
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| ExternalError::Download(e.to_string()))?;

    Ok(bytes.to_vec())
}

/// Extrae el texto de un PDF: extractor primario y, si el resultado parece
/// un documento escaneado, la cadena de OCR de respaldo.
pub async fn extract_text(
    state: &AppState,
    pdf_bytes: &[u8],
    document_title: &str,
) -> Result<String, ExternalError> {
    let (primary, primary_failed) = match pdf_extract::extract_text_from_mem(pdf_bytes) {
        Ok(text) => (text, false),
        Err(e) => {
            warn!(
                "Extractor primario falló para '{}': {}. Ruta OCR.",
                document_title, e
            );
            (String::new(), true)
        }
    };

    if !ocr::appears_scanned(&primary) {
        return Ok(primary);
    }

    info!(
        "'{}' parece un documento escaneado ({} caracteres útiles); aplicando OCR",
        document_title,
        primary.chars().count()
    );
    match ocr::extract_text_with_ocr(&state.config, &state.http, pdf_bytes, document_title).await {
        Ok(text) => Ok(text),
        Err(e) if primary_failed => Err(ExternalError::Extract(format!(
            "extractor primario y cadena OCR fallaron: {e}"
        ))),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------
// CHUNKING
// ---------------------------------------------------------------------

/// Divide el texto en chunks solapados, prefiriendo cortar en un punto
/// (fin de oración) si cae pasada la mitad de la ventana. Los fragmentos
/// por debajo del mínimo se descartan.
pub fn chunk_text(text: &str, max_chars: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let mut end = (start + max_chars).min(chars.len());

        if end < chars.len() {
            if let Some(rel) = chars[start..end].iter().rposition(|c| *c == '.') {
                let breakpoint = start + rel;
                if breakpoint > start + max_chars / 2 {
                    end = breakpoint + 1;
                }
            }
        }

        let piece: String = chars[start..end].iter().collect();
        let trimmed = piece.trim();
        if trimmed.chars().count() > MIN_CHUNK_CHARS {
            chunks.push(trimmed.to_string());
        }

        start = (start + 1).max(end.saturating_sub(overlap));
    }

    chunks
}

// ---------------------------------------------------------------------
// CLASIFICACIÓN Y PRIORIDAD
// ---------------------------------------------------------------------

/// Regla de prioridad: dentro de un grupo gana la primera que dispara; los
/// grupos son aditivos entre sí. La precedencia es dato, no control de
/// flujo.
struct ReglaPrioridad {
    grupo: u8,
    /// Todas estas palabras deben aparecer.
    all: &'static [&'static str],
    /// Y al menos una de estas (si la lista no está vacía).
    any: &'static [&'static str],
    score: i32,
}

const REGLAS_PRIORIDAD: &[ReglaPrioridad] = &[
    // Estados financieros: auditados por encima del resto
    ReglaPrioridad { grupo: 0, all: &["auditado", "financiero"], any: &[], score: 100 },
    ReglaPrioridad { grupo: 0, all: &["financiero"], any: &["estado", "eeff"], score: 80 },
    // Memorias e informes anuales
    ReglaPrioridad { grupo: 1, all: &[], any: &["memoria anual", "informe anual"], score: 70 },
    // Calificaciones de riesgo
    ReglaPrioridad { grupo: 2, all: &["calificaci", "riesgo"], any: &[], score: 50 },
    // Hechos relevantes
    ReglaPrioridad { grupo: 3, all: &[], any: &["relevante"], score: 30 },
    // Mención financiera genérica
    ReglaPrioridad { grupo: 4, all: &["financiero"], any: &[], score: 20 },
    ReglaPrioridad { grupo: 5, all: &["informe"], any: &[], score: 10 },
];

/// Palabras que marcan un estado financiero (extracción estructurada
/// condicional).
const KEYWORDS_ESTADO_FINANCIERO: &[&str] =
    &["estados financieros", "financiero", "auditado", "balance", "eeff"];

/// Puntaje de prioridad de un documento según señales del título y tipo.
/// Los estados auditados cargan el mayor valor informativo y el coste de
/// ingesta por corrida está acotado, de ahí el orden.
pub fn priority_score(doc: &DocumentoCrudo) -> i32 {
    let combined = format!("{} {}", doc.doc_type, doc.title).to_lowercase();
    let mut matched_groups: HashSet<u8> = HashSet::new();
    let mut total = 0;

    for regla in REGLAS_PRIORIDAD {
        if matched_groups.contains(&regla.grupo) {
            continue;
        }
        let all_ok = regla.all.iter().all(|kw| combined.contains(kw));
        let any_ok = regla.any.is_empty() || regla.any.iter().any(|kw| combined.contains(kw));
        if all_ok && any_ok {
            matched_groups.insert(regla.grupo);
            total += regla.score;
        }
    }

    total
}

/// ¿El documento es heurísticamente un estado financiero?
pub fn is_financial_statement(doc: &DocumentoCrudo) -> bool {
    let combined = format!("{} {}", doc.doc_type, doc.title).to_lowercase();
    KEYWORDS_ESTADO_FINANCIERO
        .iter()
        .any(|kw| combined.contains(kw))
}

/// Parsea la fecha de publicación en sus múltiples formatos (ISO,
/// DD/MM/YYYY, DD-MM-YYYY, con hora opcional).
pub fn parse_document_date(raw: &str) -> Option<NaiveDate> {
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(d);
    }

    let date_part = raw.split_whitespace().next().unwrap_or(raw);
    for fmt in ["%d/%m/%Y", "%d-%m-%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(date_part, fmt) {
            return Some(d);
        }
    }

    None
}

/// Id de documento derivado del título (estable entre corridas).
pub fn document_id_from_title(title: &str) -> String {
    title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(50)
        .collect()
}

// ---------------------------------------------------------------------
// PROCESAMIENTO DE DOCUMENTOS
// ---------------------------------------------------------------------

/// Resultado del procesamiento de un documento individual.
pub struct DocumentoProcesado {
    pub chunks: Vec<ChunkRecord>,
    /// "ok", "super_chunk" o la clase de error que degradó el documento.
    pub status: String,
}

/// Procesa un documento completo: descarga, extracción, clasificación,
/// extracción estructurada condicional, chunking y embeddings. Los fallos
/// degradan el documento a cero chunks; nunca se propagan.
pub async fn process_document(
    state: &AppState,
    doc: &DocumentoCrudo,
    issuer_name: &str,
    issuer_id: &str,
) -> DocumentoProcesado {
    info!("Procesando documento: {} para {}", doc.title, issuer_name);

    let pdf_bytes = match download_document(&state.http, &doc.url).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Error descargando {}: {}", doc.title, e);
            return DocumentoProcesado { chunks: Vec::new(), status: e.kind().to_string() };
        }
    };

    let text = match extract_text(state, &pdf_bytes, &doc.title).await {
        Ok(text) => text,
        Err(e) => {
            error!("Error extrayendo texto de {}: {}", doc.title, e);
            return DocumentoProcesado { chunks: Vec::new(), status: e.kind().to_string() };
        }
    };

    if text.chars().count() < MIN_TEXT_LEN {
        warn!("Documento {} sin contenido de texto suficiente", doc.title);
        return DocumentoProcesado { chunks: Vec::new(), status: "empty_text".to_string() };
    }

    let document_id = document_id_from_title(&doc.title);
    let processed_at = Utc::now().to_rfc3339();
    let metadata = ChunkMetadata {
        issuer_name: issuer_name.to_string(),
        document_title: doc.title.clone(),
        document_url: doc.url.clone(),
        document_date: doc.date.clone(),
        document_type: doc.doc_type.clone(),
        processed_at,
    };

    let mut records: Vec<ChunkRecord> = Vec::new();
    let mut status = "ok".to_string();

    // Extracción estructurada condicional: el digest se comprime en un
    // super chunk con índice reservado.
    if is_financial_statement(doc) {
        match state.llm.extract_financial_digest(&doc.title, &text).await {
            Ok(digest) if !digest.resumen_markdown.trim().is_empty() => {
                if let Some(periodo) = &digest.metricas.metadata.periodo {
                    info!("Digest financiero de {} con período {}", doc.title, periodo);
                }
                let digest_text = digest.resumen_markdown.trim().to_string();
                match state
                    .llm
                    .embed_chunks(&[("super".to_string(), digest_text.clone())])
                    .await
                {
                    Ok(embedded) => {
                        if let Some(emb) = embedded.into_iter().next() {
                            records.push(ChunkRecord {
                                issuer_id: issuer_id.to_string(),
                                document_id: document_id.clone(),
                                chunk_index: SUPER_CHUNK_INDEX,
                                text: digest_text,
                                embedding: emb.vector,
                                metadata: metadata.clone(),
                            });
                            status = "super_chunk".to_string();
                        }
                    }
                    Err(e) => warn!("No se pudo embeber el super chunk de {}: {}", doc.title, e),
                }
            }
            Ok(_) => warn!("Digest vacío para {}", doc.title),
            Err(e) => warn!("Extracción estructurada falló para {}: {}", doc.title, e),
        }
    }

    // Chunking ordinario y embeddings en bloque
    let raw_chunks = chunk_text(&text, state.config.chunk_max_chars, state.config.chunk_overlap);
    info!("Creados {} chunks para {}", raw_chunks.len(), doc.title);

    if !raw_chunks.is_empty() {
        let pairs: Vec<(String, String)> = raw_chunks
            .into_iter()
            .enumerate()
            .map(|(i, text)| (i.to_string(), text))
            .collect();

        match state.llm.embed_chunks(&pairs).await {
            Ok(embedded) => {
                for (i, emb) in embedded.into_iter().enumerate() {
                    records.push(ChunkRecord {
                        issuer_id: issuer_id.to_string(),
                        document_id: document_id.clone(),
                        chunk_index: emb.id.parse().unwrap_or(i as i64),
                        text: emb.text,
                        embedding: emb.vector,
                        metadata: metadata.clone(),
                    });
                }
            }
            Err(e) => {
                error!("Error de embeddings para {}: {}", doc.title, e);
                if records.is_empty() {
                    status = e.kind().to_string();
                }
            }
        }
    }

    DocumentoProcesado { chunks: records, status }
}

/// Procesa los documentos de un emisor: puntúa y ordena por prioridad,
/// respeta el tope por corrida, salta urls ya procesadas y persiste los
/// chunks por lotes. Secuencial con pausa fija entre documentos.
pub async fn process_issuer_documents(
    state: &AppState,
    issuer_id: &str,
    status_arc: Arc<Mutex<Status>>,
) -> anyhow::Result<ResumenIngesta> {
    let issuer = chunk_store::get_issuer(&state.graph, issuer_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Emisor no encontrado: {issuer_id}"))?;

    let mut summary = ResumenIngesta {
        documents_total: issuer.documents.len(),
        ..Default::default()
    };

    let available_types: HashSet<&str> =
        issuer.documents.iter().map(|d| d.doc_type.as_str()).collect();
    info!(
        "Tipos de documento disponibles para {}: {:?}",
        issuer.name, available_types
    );

    // Puntuar, filtrar irrelevantes y ordenar por (prioridad, fecha)
    let mut scored: Vec<(i32, &DocumentoCrudo)> = issuer
        .documents
        .iter()
        .map(|d| (priority_score(d), d))
        .filter(|(score, _)| *score > 0)
        .collect();
    scored.sort_by(|a, b| {
        b.0.cmp(&a.0).then_with(|| {
            parse_document_date(&b.1.date).cmp(&parse_document_date(&a.1.date))
        })
    });

    summary.documents_relevant = scored.len();
    info!(
        "Filtrados {} documentos relevantes de {} totales para {}",
        scored.len(),
        issuer.documents.len(),
        issuer.name
    );

    let cap = state.config.max_documents_per_run.min(scored.len());
    let mut any_financial = false;

    for (index, (score, doc)) in scored.iter().take(cap).enumerate() {
        {
            let mut status = status_arc.lock().unwrap();
            status.message = format!(
                "[{}/{}] Procesando: {}...",
                index + 1,
                cap,
                doc.title
            );
            status.progress = (index + 1) as f32 / cap as f32;
        }

        match chunk_store::is_document_processed(&state.graph, &doc.url).await {
            Ok(true) => {
                info!("Documento ya procesado, omitiendo: {}", doc.title);
                summary.documents_skipped += 1;
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("No se pudo verificar el estado de {}: {}", doc.url, e);
            }
        }

        let result = process_document(state, doc, &issuer.name, issuer_id).await;

        if result.chunks.is_empty() {
            summary.documents_skipped += 1;
            info!(
                "Documento degradado sin chunks ({}): {} [prioridad {}]",
                result.status, doc.title, score
            );
        } else {
            match chunk_store::store_chunks(&state.graph, &result.chunks).await {
                Ok(stored) => {
                    summary.documents_processed += 1;
                    summary.chunks_created += stored;
                    if result.status == "super_chunk" {
                        summary.super_chunks_created += 1;
                    }
                    if is_financial_statement(doc) {
                        any_financial = true;
                    }
                    if let Err(e) =
                        chunk_store::record_processed_document(&state.graph, issuer_id, doc, stored)
                            .await
                    {
                        warn!("No se pudo registrar {} como procesado: {}", doc.url, e);
                    }
                }
                Err(e) => {
                    error!("Error almacenando chunks de {}: {}", doc.title, e);
                    summary.documents_skipped += 1;
                }
            }
        }

        // Pausa fija entre documentos (cuotas de embeddings/generación)
        if index + 1 < cap {
            tokio::time::sleep(std::time::Duration::from_millis(
                state.config.delay_between_docs_ms,
            ))
            .await;
        }
    }

    // Actualizar la contabilidad del emisor
    let mut updated = issuer.clone();
    updated.documents_processed += summary.documents_processed as i64;
    updated.last_processed = Some(Utc::now());
    chunk_store::upsert_issuer(&state.graph, &updated).await?;

    // Un estado financiero nuevo dispara el recálculo de métricas
    if any_financial {
        info!(
            "Documento financiero nuevo para {}; disparando recálculo de métricas...",
            updated.name
        );
        if let Err(e) = metrics::extract_issuer_metrics(state, issuer_id).await {
            error!("Recálculo de métricas falló para {}: {}", updated.name, e);
        }
    }

    info!("Ingesta completada para {}. {}", updated.name, summary);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(title: &str, doc_type: &str, date: &str) -> DocumentoCrudo {
        DocumentoCrudo {
            title: title.to_string(),
            url: format!("/docs/{}.pdf", document_id_from_title(title)),
            date: date.to_string(),
            doc_type: doc_type.to_string(),
        }
    }

    #[test]
    fn chunking_respeta_tamano_y_minimo() {
        let text = "A".repeat(5000);
        let chunks = chunk_text(&text, 1500, 200);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 1500);
            assert!(chunk.chars().count() > 10);
        }
    }

    #[test]
    fn chunking_cubre_el_texto_sin_huecos_mayores_que_el_solape() {
        let text: String = (0..120)
            .map(|i| format!("Esta es la oracion numero {i} del informe financiero."))
            .collect::<Vec<_>>()
            .join(" ");

        let max = 200;
        let overlap = 40;
        let chunks = chunk_text(&text, max, overlap);
        assert!(chunks.len() > 2);

        let mut prev_end = 0usize;
        for chunk in &chunks {
            let start = text.find(chunk.as_str()).expect("el chunk debe ser subcadena");
            let end = start + chunk.len();
            // sin hueco mayor que el solape respecto al chunk anterior
            assert!(
                start.saturating_sub(prev_end) <= overlap,
                "hueco demasiado grande: start={start}, prev_end={prev_end}"
            );
            prev_end = end;
        }
        // el final del texto queda cubierto
        assert_eq!(prev_end, text.len());
    }

    #[test]
    fn chunking_prefiere_cortar_en_fin_de_oracion() {
        let text = format!(
            "{}. {}",
            "Primera oracion bastante larga del informe financiero anual consolidado",
            "B".repeat(300)
        );
        let chunks = chunk_text(&text, 100, 10);
        assert!(chunks[0].ends_with('.'));
    }

    #[test]
    fn chunking_de_texto_vacio_o_corto() {
        assert!(chunk_text("", 1500, 200).is_empty());
        assert!(chunk_text("corto.", 1500, 200).is_empty());

        let small = "Un texto pequeno que cabe entero en un solo chunk.";
        let chunks = chunk_text(small, 1500, 200);
        assert_eq!(chunks, vec![small.to_string()]);
    }

    #[test]
    fn los_auditados_puntuan_por_encima_de_todo() {
        let auditado = doc(
            "Estados Financieros Auditados 2024",
            "Estados Financieros",
            "01/01/2024",
        );
        let eeff = doc("EEFF al 30 de junio", "Estado Financiero", "30/06/2024");
        let memoria = doc("Memoria Anual 2023", "Informe", "01/03/2024");
        let rating = doc("Calificación de Riesgo", "Informe", "01/12/2024");
        let hecho = doc("Hecho Relevante", "Hecho Relevante", "01/12/2024");
        let random = doc("Convocatoria a asamblea", "Otro", "01/12/2024");

        let s_auditado = priority_score(&auditado);
        let s_eeff = priority_score(&eeff);
        let s_memoria = priority_score(&memoria);
        let s_rating = priority_score(&rating);
        let s_hecho = priority_score(&hecho);

        assert!(s_auditado > s_eeff);
        assert!(s_eeff > s_memoria);
        assert!(s_memoria > s_rating);
        assert!(s_rating > s_hecho);
        assert_eq!(priority_score(&random), 0);
    }

    #[test]
    fn clasificacion_de_estado_financiero() {
        assert!(is_financial_statement(&doc(
            "Estados Financieros Auditados 2024",
            "",
            ""
        )));
        assert!(is_financial_statement(&doc("Balance General", "", "")));
        assert!(!is_financial_statement(&doc("Hecho Relevante", "", "")));
    }

    #[test]
    fn parsea_fechas_en_varios_formatos() {
        assert_eq!(
            parse_document_date("15/03/2024"),
            NaiveDate::from_ymd_opt(2024, 3, 15)
        );
        assert_eq!(
            parse_document_date("15-03-2024"),
            NaiveDate::from_ymd_opt(2024, 3, 15)
        );
        assert_eq!(
            parse_document_date("2024-03-15"),
            NaiveDate::from_ymd_opt(2024, 3, 15)
        );
        assert_eq!(
            parse_document_date("2024-03-15T10:30:00Z"),
            NaiveDate::from_ymd_opt(2024, 3, 15)
        );
        assert_eq!(parse_document_date("15/03/2024 10:30"), NaiveDate::from_ymd_opt(2024, 3, 15));
        assert_eq!(parse_document_date("fecha rara"), None);
        assert_eq!(parse_document_date(""), None);
    }

    #[test]
    fn el_id_de_documento_es_estable_y_acotado() {
        let id = document_id_from_title("Estados Financieros Auditados 2024 (versión final)");
        assert_eq!(id, "Estados_Financieros_Auditados_2024__versi_n_final_");
        assert!(id.len() <= 50);
        assert_eq!(
            document_id_from_title("Estados Financieros Auditados 2024 (versión final)"),
            id
        );
    }
}
