//! Extracción y normalización de métricas financieras estructuradas por
//! emisor: snapshot puntual y reconstrucción histórica.
//!
//! El snapshot se fusiona (no se sobrescribe) con los campos previos y
//! deja un sub-registro inmutable por período como pista de auditoría. Las
//! lecturas pasan por la caché volátil de TTL corto; la capa durable
//! (Neo4j) es el respaldo en fallo de caché y tras un reinicio.

use anyhow::{anyhow, Result};
use chrono::{Datelike, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::chunk_store::{self, StoredChunk};
use crate::ingest::parse_document_date;
use crate::models::{MetricasEmisor, PuntoHistorico};
use crate::retrieval::target_years;

/// Tope de chunks que entran al contexto del extractor puntual.
const TARGET_CONTEXT_CHUNKS: usize = 120;
/// Tope de chunks por documento: evita llenar el contexto con 50 trozos
/// del mismo informe resumido.
const MAX_CHUNKS_PER_DOC: usize = 50;
/// Corte del contexto en caracteres (extractor puntual).
const CONTEXT_CHAR_CAP: usize = 500_000;
/// Corte del contexto en caracteres (reconstrucción histórica).
const HISTORY_CONTEXT_CHAR_CAP: usize = 900_000;
/// Pool de candidatos para el extractor puntual.
const METRICS_CANDIDATE_POOL: usize = 1500;
/// Pool más amplio para la reconstrucción histórica.
const HISTORY_CANDIDATE_POOL: usize = 3500;

/// Empuje de ordenamiento: muchos auditados anuales llevan fecha "1 de
/// enero", que los haría parecer más viejos que un informe de calificación
/// de diciembre. El empuje (~5 años en ms) garantiza que el auditado gane.
const AUDITED_BOOST_MS: i64 = 157_700_000_000;
const RATING_BOOST_MS: i64 = 5_000_000_000;
const PROSPECTUS_BOOST_MS: i64 = 2_500_000_000;

// ---------------------------------------------------------------------
// SELECCIÓN DE CONTEXTO
// ---------------------------------------------------------------------

/// Chunk clasificado para la selección de contexto del extractor.
#[derive(Debug, Clone)]
pub struct ChunkClasificado {
    pub text: String,
    pub title: String,
    pub date: String,
    pub chunk_index: i64,
    pub is_audited: bool,
    pub is_financial: bool,
    pub is_rating: bool,
    pub is_prospectus: bool,
}

pub fn clasifica_chunk(stored: &StoredChunk) -> ChunkClasificado {
    let title = stored.metadata.document_title.to_lowercase();
    let text_head: String = stored.text.chars().take(1000).collect::<String>().to_lowercase();
    let text_lower = stored.text.to_lowercase();

    let is_audited = ["auditado", "estados financieros", "informe de los auditores"]
        .iter()
        .any(|kw| title.contains(kw))
        || text_head.contains("informe de los auditores");
    let is_financial = stored.metadata.document_type == "Estados Financieros"
        || ["financiero", "balance", "resultado", "auditado"]
            .iter()
            .any(|kw| text_lower.contains(kw));
    let is_rating = ["calificacion", "calificación", "riesgo", "rating"]
        .iter()
        .any(|kw| title.contains(kw));
    let is_prospectus = ["prospecto", "informativo"].iter().any(|kw| title.contains(kw));

    ChunkClasificado {
        text: stored.text.clone(),
        title: stored.metadata.document_title.clone(),
        date: stored.metadata.document_date.clone(),
        chunk_index: stored.chunk_index,
        is_audited,
        is_financial,
        is_rating,
        is_prospectus,
    }
}

fn date_score_ms(date: &str) -> i64 {
    parse_document_date(date)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(0)
}

fn boost_ms(chunk: &ChunkClasificado) -> i64 {
    if chunk.is_audited {
        AUDITED_BOOST_MS
    } else if chunk.is_rating {
        RATING_BOOST_MS
    } else if chunk.is_prospectus {
        PROSPECTUS_BOOST_MS
    } else {
        0
    }
}

/// Ordena por puntaje (fecha + empuje) descendente; a igual puntaje van
/// primero los financieros y luego el orden de lectura del documento.
pub fn ordena_chunks(chunks: &mut [ChunkClasificado]) {
    chunks.sort_by(|a, b| {
        let score_a = date_score_ms(&a.date) + boost_ms(a);
        let score_b = date_score_ms(&b.date) + boost_ms(b);
        score_b
            .cmp(&score_a)
            .then_with(|| b.is_financial.cmp(&a.is_financial))
            .then_with(|| a.chunk_index.cmp(&b.chunk_index))
    });
}

/// Selección con diversidad por documento: mezcla trozos de distintos
/// reportes relevantes en lugar de agotar el cupo con uno solo.
pub fn select_context_chunks(chunks: &[ChunkClasificado]) -> Vec<&ChunkClasificado> {
    let mut selected = Vec::new();
    let mut per_doc: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();

    for chunk in chunks {
        if selected.len() >= TARGET_CONTEXT_CHUNKS {
            break;
        }
        let count = per_doc.entry(chunk.title.as_str()).or_insert(0);
        if *count < MAX_CHUNKS_PER_DOC {
            selected.push(chunk);
            *count += 1;
        }
    }

    selected
}

/// Concatena el contexto etiquetando fecha y tipo de cada trozo. Las
/// fechas "1 de enero" de los auditados se presentan como cierre fiscal
/// del 31 de diciembre para no parecer datos viejos.
pub fn build_metrics_context(selected: &[&ChunkClasificado]) -> String {
    let joined = selected
        .iter()
        .map(|c| {
            let mut date_label = if c.date.is_empty() {
                "Fecha desconocida".to_string()
            } else {
                c.date.clone()
            };
            if c.is_audited && date_label.contains("-01-01") {
                let year = date_label.split('-').next().unwrap_or_default().to_string();
                date_label = format!("{year}-12-31 (CIERRE FISCAL)");
            }
            let tipo = if c.is_audited {
                "TIPO: AUDITADO"
            } else if c.is_financial {
                "TIPO: FINANCIERO"
            } else {
                "TIPO: OTRO"
            };
            format!("[{date_label}] {tipo}\n{}", c.text)
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    joined.chars().take(CONTEXT_CHAR_CAP).collect()
}

// ---------------------------------------------------------------------
// NORMALIZACIÓN
// ---------------------------------------------------------------------

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Post-procesa la salida del modelo: recuperación heurística de totales,
/// inferencia y conversión de moneda, y ratios derivados.
///
/// Regla de moneda: marcadores NIO declarados fuerzan conversión; sin
/// moneda declarada, activos por encima del umbral implican moneda local.
/// Tras la conversión todas las cifras comparten una sola moneda (USD).
pub fn normalize_snapshot(m: &mut MetricasEmisor, rate: f64, umbral_nio: f64) {
    // (a) Recuperación: activos = pasivos + patrimonio
    match (
        m.capital.activos_totales,
        m.capital.pasivos,
        m.capital.patrimonio,
    ) {
        (Some(a), None, Some(p)) => m.capital.pasivos = Some(round2(a - p)),
        (None, Some(l), Some(p)) => {
            let derived = round2(l + p);
            m.capital.activos_totales = Some(derived);
            info!("Activos Totales derivados de Pasivos + Patrimonio: {derived}");
        }
        (Some(a), Some(l), None) => m.capital.patrimonio = Some(round2(a - l)),
        _ => {}
    }

    // (b) Inferencia de moneda
    let declared = m
        .metadata
        .moneda
        .clone()
        .unwrap_or_default()
        .to_uppercase();
    let symbol = m
        .metadata
        .simbolo_encontrado
        .clone()
        .unwrap_or_default()
        .to_uppercase();

    let declared_nio = declared.contains("NIO")
        || declared.contains("C$")
        || declared.contains("CORDOBA")
        || declared.contains("CÓRDOBA")
        || symbol == "C$"
        || symbol.contains("CORDOBA")
        || symbol.contains("CÓRDOBA");
    let declared_usd =
        declared.contains("USD") || declared.contains("DOLAR") || declared.contains("DÓLAR");
    let inferred_nio = !declared_nio
        && !declared_usd
        && m.capital
            .activos_totales
            .map(|a| a > umbral_nio)
            .unwrap_or(false);

    // (c) Conversión a la moneda de reporte
    if declared_nio || inferred_nio {
        let convert = |v: Option<f64>| v.map(|x| round2(x / rate));

        m.capital.activos_totales = convert(m.capital.activos_totales);
        m.capital.pasivos = convert(m.capital.pasivos);
        m.capital.patrimonio = convert(m.capital.patrimonio);
        m.liquidez.activo_corriente = convert(m.liquidez.activo_corriente);
        m.liquidez.pasivo_corriente = convert(m.liquidez.pasivo_corriente);
        m.liquidez.capital_trabajo = convert(m.liquidez.capital_trabajo);
        m.solvencia.gastos_financieros = convert(m.solvencia.gastos_financieros);
        m.rentabilidad.ingresos_totales = convert(m.rentabilidad.ingresos_totales);
        m.rentabilidad.utilidad_neta = convert(m.rentabilidad.utilidad_neta);

        m.metadata.nota = Some(format!("Convertido desde NIO (tasa {rate:.2})"));
        info!("Conversión NIO→USD aplicada (declarada={declared}, símbolo={symbol})");
    }
    m.metadata.moneda = Some("USD".to_string());

    derive_ratios(m);
}

/// Completa los ratios que el modelo no devolvió usando los absolutos.
fn derive_ratios(m: &mut MetricasEmisor) {
    let activos = m.capital.activos_totales;
    let pasivos = m.capital.pasivos;
    let patrimonio = m.capital.patrimonio;

    if let (Some(l), Some(a)) = (pasivos, activos) {
        if a > 0.0 && m.solvencia.deuda_activos.map(|v| v < 1.0).unwrap_or(true) {
            m.solvencia.deuda_activos = Some(round2(l / a * 100.0));
        }
    }
    if let (Some(l), Some(p)) = (pasivos, patrimonio) {
        if p > 0.0 && m.solvencia.deuda_patrimonio.is_none() {
            m.solvencia.deuda_patrimonio = Some(round2(l / p));
        }
    }

    // Utilidad implícita desde ROE/ROA cuando falta el absoluto
    if m.rentabilidad.utilidad_neta.is_none() {
        if let (Some(roe), Some(p)) = (m.rentabilidad.roe, patrimonio) {
            if roe > 0.0 && p > 0.0 {
                m.rentabilidad.utilidad_neta = Some(round2(roe / 100.0 * p));
            }
        } else if let (Some(roa), Some(a)) = (m.rentabilidad.roa, activos) {
            if roa > 0.0 && a > 0.0 {
                m.rentabilidad.utilidad_neta = Some(round2(roa / 100.0 * a));
            }
        }
    }

    if let Some(u) = m.rentabilidad.utilidad_neta {
        if let Some(p) = patrimonio {
            if p > 0.0 && m.rentabilidad.roe.map(|v| v < 1.0).unwrap_or(true) {
                m.rentabilidad.roe = Some(round2(u / p * 100.0));
            }
        }
        if let Some(a) = activos {
            if a > 0.0 && m.rentabilidad.roa.map(|v| v < 1.0).unwrap_or(true) {
                m.rentabilidad.roa = Some(round2(u / a * 100.0));
            }
        }
        if let Some(i) = m.rentabilidad.ingresos_totales {
            if i > 0.0 && m.rentabilidad.margen_neto.is_none() {
                m.rentabilidad.margen_neto = Some(round2(u / i * 100.0));
            }
        }
    }

    if let (Some(i), Some(a)) = (m.rentabilidad.ingresos_totales, activos) {
        if a > 0.0 && m.eficiencia.rotacion_activos.is_none() {
            m.eficiencia.rotacion_activos = Some(round2(i / a));
        }
    }

    if let (Some(ac), Some(pc)) = (m.liquidez.activo_corriente, m.liquidez.pasivo_corriente) {
        if pc > 0.0 {
            if m.liquidez.ratio_circulante.is_none() {
                m.liquidez.ratio_circulante = Some(round2(ac / pc));
            }
            if m.liquidez.capital_trabajo.is_none() {
                m.liquidez.capital_trabajo = Some(round2(ac - pc));
            }
        }
    }
}

/// Fusión recursiva del snapshot: los objetos se combinan campo a campo y
/// un `null` entrante significa "sin información" (no pisa un valor
/// previo). El último escritor gana campo a campo, no documento a
/// documento.
pub fn merge_snapshot(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(key) {
                    Some(base_value) => merge_snapshot(base_value, patch_value),
                    None => {
                        base_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (base_slot, patch_value) => {
            if !patch_value.is_null() {
                *base_slot = patch_value.clone();
            }
        }
    }
}

/// Valida la salida histórica contra la lista completa de años objetivo:
/// cualquier año ausente entra como marcador nulo en lugar de perderse.
pub fn validate_history(
    history: Vec<PuntoHistorico>,
    years: &[i32],
) -> Vec<PuntoHistorico> {
    years
        .iter()
        .map(|year| {
            history
                .iter()
                .find(|h| h.period == year.to_string())
                .cloned()
                .unwrap_or_else(|| PuntoHistorico::vacio(*year))
        })
        .collect()
}

// ---------------------------------------------------------------------
// EXTRACCIÓN PUNTUAL
// ---------------------------------------------------------------------

/// Extrae y persiste el snapshot de métricas de un emisor.
pub async fn extract_issuer_metrics(state: &AppState, issuer_id: &str) -> Result<Value> {
    let tables = state.registry.tables(&state.graph).await;
    let canonical = tables
        .resolve(issuer_id)
        .unwrap_or_else(|| issuer_id.to_string());
    let candidates = tables.technical_ids(&canonical);

    let issuer_name = chunk_store::get_issuer(&state.graph, &canonical)
        .await?
        .map(|e| e.name)
        .unwrap_or_else(|| canonical.clone());

    let source_id = chunk_store::first_source_with_chunks(&state.graph, &candidates)
        .await?
        .ok_or_else(|| {
            anyhow!("No hay documentos procesados para el emisor {issuer_name} ({canonical})")
        })?;

    let stored =
        chunk_store::fetch_candidates(&state.graph, Some(&candidates), METRICS_CANDIDATE_POOL)
            .await?;
    let chunks_analyzed = stored.len();

    let mut classified: Vec<ChunkClasificado> = stored.iter().map(clasifica_chunk).collect();
    ordena_chunks(&mut classified);
    let selected = select_context_chunks(&classified);
    let context = build_metrics_context(&selected);

    let mut metrics = match state
        .llm
        .extract_metrics(&canonical, &issuer_name, &context)
        .await
    {
        Ok(metrics) => metrics,
        // Salida malformada del modelo: objeto mínimo de respaldo; la
        // fusión posterior no pisa valores previos con nulos.
        Err(e @ crate::errors::ExternalError::MalformedOutput(_)) => {
            warn!("Extracción de métricas con salida malformada para {issuer_name}: {e}");
            MetricasEmisor::default()
        }
        Err(e) => return Err(anyhow!(e.to_string())),
    };

    let rate = match chunk_store::load_exchange_rate(&state.graph).await {
        Ok(Some(rate)) => rate,
        Ok(None) => state.config.tasa_cambio_fallback,
        Err(e) => {
            warn!("No se pudo leer la tasa de cambio, usando el respaldo: {e}");
            state.config.tasa_cambio_fallback
        }
    };
    normalize_snapshot(&mut metrics, rate, state.config.umbral_nio);

    let mut snapshot = serde_json::to_value(&metrics)?;
    merge_snapshot(
        &mut snapshot,
        &json!({
            "issuerId": canonical,
            "sourceId": source_id,
            "issuerName": issuer_name,
            "extractedAt": Utc::now().to_rfc3339(),
            "chunksAnalyzed": chunks_analyzed,
        }),
    );

    // Fusionar con el snapshot previo (último escritor gana campo a campo)
    let merged = match chunk_store::load_metric_snapshot(&state.graph, &canonical).await? {
        Some(mut prior) => {
            merge_snapshot(&mut prior, &snapshot);
            prior
        }
        None => snapshot,
    };

    chunk_store::save_metric_snapshot(&state.graph, &canonical, &merged).await?;

    // Sub-registro por período para la pista de auditoría
    if let Some(periodo) = &metrics.metadata.periodo {
        chunk_store::save_metric_period(&state.graph, &canonical, periodo, &merged).await?;
        info!("Snapshot guardado para {issuer_name}, período {periodo}");
    }

    // Una extracción fresca invalida la caché volátil del emisor
    state.cache.invalidate(&metrics_cache_key(&canonical));
    state.cache.invalidate(&history_cache_key(&canonical));

    info!("Métricas extraídas para {issuer_name}");
    Ok(merged)
}

/// Lectura memoizada del snapshot (caché volátil → capa durable).
pub async fn get_issuer_metrics(state: &AppState, issuer_id: &str) -> Result<Option<Value>> {
    let key = metrics_cache_key(issuer_id);
    if let Some(cached) = state.cache.get(&key) {
        return Ok(Some(cached));
    }

    let snapshot = chunk_store::load_metric_snapshot(&state.graph, issuer_id).await?;
    if let Some(value) = &snapshot {
        state
            .cache
            .set(&key, value.clone(), state.config.metrics_cache_ttl_secs);
    }
    Ok(snapshot)
}

/// Compara los snapshots de varios emisores (los sin métricas se omiten).
pub async fn compare_issuer_metrics(state: &AppState, issuer_ids: &[String]) -> Result<Vec<Value>> {
    let mut comparisons = Vec::new();
    for issuer_id in issuer_ids {
        if let Some(metrics) = get_issuer_metrics(state, issuer_id).await? {
            comparisons.push(json!({
                "issuerId": issuer_id,
                "issuerName": metrics.get("issuerName").cloned().unwrap_or(Value::Null),
                "metrics": metrics,
            }));
        }
    }
    Ok(comparisons)
}

// ---------------------------------------------------------------------
// RECONSTRUCCIÓN HISTÓRICA
// ---------------------------------------------------------------------

/// Reconstruye la serie histórica de los años objetivo.
///
/// La selección de candidatos es la versión simplificada (los N más
/// recientes), sin diversidad por año: no se asume paridad con el
/// selector del extractor puntual.
pub async fn extract_historical_metrics(
    state: &AppState,
    issuer_id: &str,
) -> Result<Vec<PuntoHistorico>> {
    info!("Extracción histórica para {issuer_id}");
    let tables = state.registry.tables(&state.graph).await;
    let canonical = tables
        .resolve(issuer_id)
        .unwrap_or_else(|| issuer_id.to_string());
    let candidates = tables.technical_ids(&canonical);

    let issuer_name = chunk_store::get_issuer(&state.graph, &canonical)
        .await?
        .map(|e| e.name)
        .unwrap_or_else(|| canonical.clone());

    let source_id = chunk_store::first_source_with_chunks(&state.graph, &candidates)
        .await?
        .ok_or_else(|| anyhow!("No hay chunks para la extracción histórica de {issuer_name}"))?;

    let stored =
        chunk_store::fetch_candidates(&state.graph, Some(&candidates), HISTORY_CANDIDATE_POOL)
            .await?;

    let context: String = stored
        .iter()
        .map(|c| {
            format!(
                "\n---\nDOCUMENTO: {} | FECHA: {}\nCONTENIDO: {}",
                c.metadata.document_title, c.metadata.document_date, c.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
        .chars()
        .take(HISTORY_CONTEXT_CHAR_CAP)
        .collect();

    let years = target_years(Utc::now().year());
    let history = match state.llm.extract_history(&issuer_name, &years, &context).await {
        Ok(history) => history,
        // Con salida malformada la validación rellena todos los años con
        // marcadores nulos: "sin dato", no "sin intento".
        Err(e @ crate::errors::ExternalError::MalformedOutput(_)) => {
            warn!("Serie histórica malformada para {issuer_name}: {e}");
            Vec::new()
        }
        Err(e) => return Err(anyhow!(e.to_string())),
    };

    let validated = validate_history(history, &years);

    chunk_store::save_history_points(&state.graph, &canonical, &validated).await?;
    state.cache.invalidate(&history_cache_key(&canonical));

    info!(
        "Guardados {} puntos históricos para {} (fuente {})",
        validated.len(),
        issuer_name,
        source_id
    );
    Ok(validated)
}

/// Lectura memoizada de la serie histórica.
pub async fn get_issuer_history(state: &AppState, issuer_id: &str) -> Result<Vec<PuntoHistorico>> {
    let key = history_cache_key(issuer_id);
    if let Some(cached) = state.cache.get(&key) {
        if let Ok(points) = serde_json::from_value::<Vec<PuntoHistorico>>(cached) {
            return Ok(points);
        }
    }

    let points = chunk_store::load_history(&state.graph, issuer_id).await?;
    if !points.is_empty() {
        state.cache.set(
            &key,
            serde_json::to_value(&points)?,
            state.config.metrics_cache_ttl_secs,
        );
    }
    Ok(points)
}

fn metrics_cache_key(issuer_id: &str) -> String {
    format!("metrics_{issuer_id}")
}

fn history_cache_key(issuer_id: &str) -> String {
    format!("history_{issuer_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;
    use approx::assert_relative_eq;

    const RATE: f64 = 36.6243;
    const UMBRAL: f64 = 1_200_000_000.0;

    #[test]
    fn sin_moneda_declarada_y_activos_grandes_se_infiere_nio_y_convierte() {
        let mut m = MetricasEmisor::default();
        m.capital.activos_totales = Some(1_500_000_000.0);

        normalize_snapshot(&mut m, RATE, UMBRAL);

        assert_eq!(m.metadata.moneda.as_deref(), Some("USD"));
        assert_relative_eq!(
            m.capital.activos_totales.unwrap(),
            1_500_000_000.0 / RATE,
            epsilon = 0.01
        );
        assert!(m.metadata.nota.unwrap().contains("Convertido desde NIO"));
    }

    #[test]
    fn moneda_usd_declarada_no_se_convierte() {
        let mut m = MetricasEmisor::default();
        m.capital.activos_totales = Some(2_000_000_000.0);
        m.metadata.moneda = Some("USD".to_string());

        normalize_snapshot(&mut m, RATE, UMBRAL);

        assert_eq!(m.capital.activos_totales, Some(2_000_000_000.0));
        assert!(m.metadata.nota.is_none());
    }

    #[test]
    fn nio_declarado_se_convierte_aunque_los_activos_sean_pequenos() {
        let mut m = MetricasEmisor::default();
        m.capital.activos_totales = Some(19_469.0);
        m.capital.patrimonio = Some(2_000.0);
        m.metadata.moneda = Some("NIO".to_string());

        normalize_snapshot(&mut m, RATE, UMBRAL);

        assert_relative_eq!(
            m.capital.activos_totales.unwrap(),
            round2(19_469.0 / RATE),
            epsilon = 0.01
        );
    }

    #[test]
    fn recupera_el_miembro_faltante_de_la_identidad_contable() {
        // pasivos = activos − patrimonio
        let mut m = MetricasEmisor::default();
        m.capital.activos_totales = Some(1000.0);
        m.capital.patrimonio = Some(250.0);
        m.metadata.moneda = Some("USD".to_string());
        normalize_snapshot(&mut m, RATE, UMBRAL);
        assert_eq!(m.capital.pasivos, Some(750.0));

        // activos = pasivos + patrimonio
        let mut m = MetricasEmisor::default();
        m.capital.pasivos = Some(750.0);
        m.capital.patrimonio = Some(250.0);
        m.metadata.moneda = Some("USD".to_string());
        normalize_snapshot(&mut m, RATE, UMBRAL);
        assert_eq!(m.capital.activos_totales, Some(1000.0));
    }

    #[test]
    fn deriva_ratios_faltantes() {
        let mut m = MetricasEmisor::default();
        m.capital.activos_totales = Some(1000.0);
        m.capital.pasivos = Some(800.0);
        m.capital.patrimonio = Some(200.0);
        m.rentabilidad.utilidad_neta = Some(30.0);
        m.rentabilidad.ingresos_totales = Some(150.0);
        m.liquidez.activo_corriente = Some(300.0);
        m.liquidez.pasivo_corriente = Some(200.0);
        m.metadata.moneda = Some("USD".to_string());

        normalize_snapshot(&mut m, RATE, UMBRAL);

        assert_eq!(m.solvencia.deuda_activos, Some(80.0));
        assert_eq!(m.solvencia.deuda_patrimonio, Some(4.0));
        assert_eq!(m.rentabilidad.roe, Some(15.0));
        assert_eq!(m.rentabilidad.roa, Some(3.0));
        assert_eq!(m.rentabilidad.margen_neto, Some(20.0));
        assert_eq!(m.eficiencia.rotacion_activos, Some(0.15));
        assert_eq!(m.liquidez.ratio_circulante, Some(1.5));
        assert_eq!(m.liquidez.capital_trabajo, Some(100.0));
    }

    #[test]
    fn escenario_auditado_sin_moneda_detectable() {
        // "Estados Financieros Auditados 2024", activos 2.000.000.000 y
        // moneda indetectable: snapshot en USD con la cifra convertida.
        let mut m = MetricasEmisor::default();
        m.capital.activos_totales = Some(2_000_000_000.0);
        m.metadata.periodo = Some("2024".to_string());
        m.metadata.fuente = Some("Estados Financieros Auditados 2024".to_string());

        normalize_snapshot(&mut m, RATE, UMBRAL);

        assert_eq!(m.metadata.moneda.as_deref(), Some("USD"));
        assert_relative_eq!(
            m.capital.activos_totales.unwrap(),
            2_000_000_000.0 / RATE,
            epsilon = 0.01
        );
    }

    #[test]
    fn la_fusion_no_pisa_valores_previos_con_null() {
        let mut base = json!({
            "capital": { "activosTotales": 100.0, "pasivos": 80.0 },
            "issuerName": "Banpro"
        });
        let patch = json!({
            "capital": { "activosTotales": 110.0, "pasivos": null },
            "calificacion": { "rating": "AA-" }
        });

        merge_snapshot(&mut base, &patch);

        assert_eq!(base["capital"]["activosTotales"], json!(110.0));
        assert_eq!(base["capital"]["pasivos"], json!(80.0));
        assert_eq!(base["calificacion"]["rating"], json!("AA-"));
        assert_eq!(base["issuerName"], json!("Banpro"));
    }

    #[test]
    fn la_historia_siempre_tiene_todos_los_anios_objetivo() {
        let years = vec![2021, 2022, 2023, 2024, 2025];
        let parcial = vec![
            PuntoHistorico {
                period: "2023".to_string(),
                date: Some("2023-12-31".to_string()),
                activos_totales: Some(500.0),
                utilidad_neta: Some(20.0),
                patrimonio: Some(100.0),
                moneda: None,
                fuente: Some("EEFF 2023".to_string()),
            },
        ];

        let validated = validate_history(parcial, &years);

        assert_eq!(validated.len(), 5);
        assert_eq!(validated[0].period, "2021");
        assert_eq!(validated[0].activos_totales, None);
        assert_eq!(validated[2].activos_totales, Some(500.0));
        assert_eq!(validated[4], PuntoHistorico::vacio(2025));
    }

    fn stored(title: &str, date: &str, index: i64, text: &str) -> StoredChunk {
        StoredChunk {
            id: format!("{title}_{index}"),
            chunk_index: index,
            text: text.to_string(),
            embedding: Vec::new(),
            metadata: ChunkMetadata {
                issuer_name: "FDL".to_string(),
                document_title: title.to_string(),
                document_url: String::new(),
                document_date: date.to_string(),
                document_type: String::new(),
                processed_at: String::new(),
            },
        }
    }

    #[test]
    fn el_auditado_viejo_gana_a_la_calificacion_reciente() {
        let audited = clasifica_chunk(&stored(
            "Estados Financieros Auditados FDL 2024",
            "2024-01-01",
            0,
            "Informe de los auditores independientes. Balance general.",
        ));
        let rating = clasifica_chunk(&stored(
            "Calificación de Riesgo FDL",
            "2025-03-15",
            0,
            "Informe de calificación.",
        ));

        assert!(audited.is_audited);
        assert!(rating.is_rating && !rating.is_audited);

        let mut chunks = vec![rating, audited];
        ordena_chunks(&mut chunks);
        assert!(chunks[0].is_audited, "el auditado debe ir primero");
    }

    #[test]
    fn la_seleccion_limita_chunks_por_documento() {
        let mut chunks = Vec::new();
        for i in 0..80 {
            chunks.push(clasifica_chunk(&stored(
                "Informe Unico",
                "2024-06-30",
                i,
                "texto financiero",
            )));
        }
        for i in 0..10 {
            chunks.push(clasifica_chunk(&stored(
                "Otro Informe",
                "2023-06-30",
                i,
                "texto financiero",
            )));
        }

        let selected = select_context_chunks(&chunks);
        let unico = selected.iter().filter(|c| c.title == "Informe Unico").count();
        let otro = selected.iter().filter(|c| c.title == "Otro Informe").count();
        assert_eq!(unico, 50);
        assert_eq!(otro, 10);
    }
}
