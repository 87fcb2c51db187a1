//! Modelos de dominio: emisores, documentos, chunks y métricas financieras.
//!
//! Los nombres de los campos serializados siguen el contrato camelCase que
//! consumen los dashboards (`issuerName`, `activosTotales`, ...); los grupos
//! de métricas derivan además `JsonSchema` para fijar el contrato de salida
//! del servicio de generación.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Índice reservado para el "super chunk" producido por la extracción
/// estructurada de un estado financiero. Los chunks ordinarios usan índices
/// no negativos.
pub const SUPER_CHUNK_INDEX: i64 = -1;

// ---------------------------------------------------------------------
// EMISORES Y DOCUMENTOS
// ---------------------------------------------------------------------

/// Registro de un emisor del mercado (nodo `:Emisor` en Neo4j).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Emisor {
    /// Id canónico (slug estable, nunca re-derivado).
    pub id: String,
    pub name: String,
    pub acronym: String,
    pub sector: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub detail_url: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub documents_processed: i64,
    #[serde(default)]
    pub last_processed: Option<DateTime<Utc>>,
    /// Listado crudo de documentos adjuntado por los colaboradores externos.
    #[serde(default)]
    pub documents: Vec<DocumentoCrudo>,
}

fn default_true() -> bool {
    true
}

/// Listado crudo de un documento publicado, tal como lo entregan los
/// scrapers externos. La `url` es la clave de identidad (deduplicación).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentoCrudo {
    pub title: String,
    pub url: String,
    /// Fecha de publicación en texto libre (ISO, DD/MM/YYYY, DD-MM-YYYY...).
    #[serde(default)]
    pub date: String,
    #[serde(rename = "type", default)]
    pub doc_type: String,
}

// ---------------------------------------------------------------------
// CHUNKS
// ---------------------------------------------------------------------

/// Metadatos que viajan con cada chunk y se devuelven en los resultados
/// de búsqueda.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub issuer_name: String,
    pub document_title: String,
    #[serde(default)]
    pub document_url: String,
    #[serde(default)]
    pub document_date: String,
    #[serde(default)]
    pub document_type: String,
    #[serde(default)]
    pub processed_at: String,
}

/// Un trozo de texto con su embedding, la unidad de recuperación.
/// Id derivado: `{issuerId}_{documentId}_chunk_{index}` (idempotente).
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub issuer_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub embedding: Vec<f64>,
    pub metadata: ChunkMetadata,
}

impl ChunkRecord {
    pub fn storage_id(&self) -> String {
        format!(
            "{}_{}_chunk_{}",
            self.issuer_id, self.document_id, self.chunk_index
        )
    }
}

/// Resultado de la búsqueda semántica, ordenado por similitud.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMatch {
    pub id: String,
    pub similarity: f64,
    pub text: String,
    pub metadata: ChunkMetadata,
}

// ---------------------------------------------------------------------
// MÉTRICAS FINANCIERAS
// ---------------------------------------------------------------------

/// Grupo de capital: los tres miembros cumplen
/// `activosTotales = pasivos + patrimonio` (recuperable si falta uno).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct Capital {
    #[serde(rename = "activosTotales", default)]
    pub activos_totales: Option<f64>,
    #[serde(default)]
    pub pasivos: Option<f64>,
    #[serde(default)]
    pub patrimonio: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct Liquidez {
    #[serde(rename = "activoCorriente", default)]
    pub activo_corriente: Option<f64>,
    #[serde(rename = "pasivoCorriente", default)]
    pub pasivo_corriente: Option<f64>,
    #[serde(rename = "ratioCirculante", default)]
    pub ratio_circulante: Option<f64>,
    #[serde(rename = "capitalTrabajo", default)]
    pub capital_trabajo: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct Solvencia {
    #[serde(rename = "deudaActivos", default)]
    pub deuda_activos: Option<f64>,
    #[serde(rename = "deudaPatrimonio", default)]
    pub deuda_patrimonio: Option<f64>,
    #[serde(rename = "gastosFinancieros", default)]
    pub gastos_financieros: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct Rentabilidad {
    #[serde(rename = "ingresosTotales", default)]
    pub ingresos_totales: Option<f64>,
    #[serde(rename = "utilidadNeta", default)]
    pub utilidad_neta: Option<f64>,
    #[serde(default)]
    pub roe: Option<f64>,
    #[serde(default)]
    pub roa: Option<f64>,
    #[serde(rename = "margenNeto", default)]
    pub margen_neto: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct Eficiencia {
    #[serde(rename = "rotacionActivos", default)]
    pub rotacion_activos: Option<f64>,
    #[serde(rename = "rotacionCartera", default)]
    pub rotacion_cartera: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct Calificacion {
    #[serde(default)]
    pub rating: Option<String>,
    #[serde(default)]
    pub perspectiva: Option<String>,
    /// "YYYY-MM" de la calificación.
    #[serde(default)]
    pub fecha: Option<String>,
}

/// Metadatos de la extracción: período de corte, moneda detectada y fuente.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct MetaExtraccion {
    /// Fecha de CORTE de los estados financieros ("2024", "Sept 2024"),
    /// no la fecha del informe que los cita.
    #[serde(default)]
    pub periodo: Option<String>,
    /// "NIO" o "USD"; tras la normalización siempre "USD".
    #[serde(default)]
    pub moneda: Option<String>,
    #[serde(default)]
    pub simbolo_encontrado: Option<String>,
    #[serde(default)]
    pub fuente: Option<String>,
    #[serde(default)]
    pub nota: Option<String>,
}

/// Snapshot estructurado de las métricas de un emisor, el contrato de
/// salida del servicio de generación y el registro persistido.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct MetricasEmisor {
    #[serde(default)]
    pub capital: Capital,
    #[serde(default)]
    pub liquidez: Liquidez,
    #[serde(default)]
    pub solvencia: Solvencia,
    #[serde(default)]
    pub rentabilidad: Rentabilidad,
    #[serde(default)]
    pub eficiencia: Eficiencia,
    #[serde(default)]
    pub calificacion: Calificacion,
    #[serde(default)]
    pub metadata: MetaExtraccion,
}

/// Un punto de la serie histórica reconstruida. Los años sin datos se
/// rellenan con valores nulos: "sin dato" es distinto de "sin intento".
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PuntoHistorico {
    /// Año fiscal ("2023").
    pub period: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(rename = "activosTotales", default)]
    pub activos_totales: Option<f64>,
    #[serde(rename = "utilidadNeta", default)]
    pub utilidad_neta: Option<f64>,
    #[serde(default)]
    pub patrimonio: Option<f64>,
    #[serde(default)]
    pub moneda: Option<String>,
    #[serde(default)]
    pub fuente: Option<String>,
}

impl PuntoHistorico {
    /// Marcador explícito para un año que el modelo no devolvió.
    pub fn vacio(year: i32) -> Self {
        Self {
            period: year.to_string(),
            date: Some(format!("{year}-12-31")),
            activos_totales: None,
            utilidad_neta: None,
            patrimonio: None,
            moneda: None,
            fuente: None,
        }
    }
}

/// Digest de la extracción estructurada condicional de un estado
/// financiero: métricas compactas más un resumen limpio en Markdown que se
/// comprime en el super chunk.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct DigestFinanciero {
    #[serde(default)]
    pub metricas: MetricasEmisor,
    /// Resumen en Markdown del estado financiero (tablas incluidas).
    #[serde(default)]
    pub resumen_markdown: String,
}
