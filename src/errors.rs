//! Taxonomía de errores para las llamadas a servicios externos.
//!
//! Cada wrapper de llamada externa (descarga, extracción, OCR, embeddings,
//! generación, almacenamiento) devuelve `Result<T, ExternalError>`. El fallo
//! se registra y se degrada en la frontera de la unidad de trabajo
//! (documento, chunk o campo de métrica); nunca aborta el lote completo.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("fallo de descarga: {0}")]
    Download(String),

    #[error("fallo de extracción de texto: {0}")]
    Extract(String),

    #[error("fallo de OCR: {0}")]
    Ocr(String),

    #[error("fallo generando embeddings: {0}")]
    Embedding(String),

    #[error("fallo del servicio de generación: {0}")]
    Generation(String),

    #[error("salida del modelo malformada: {0}")]
    MalformedOutput(String),

    #[error("fallo de almacenamiento: {0}")]
    Storage(String),
}

impl ExternalError {
    /// Etiqueta corta para logging y para el campo `status` de ingesta.
    pub fn kind(&self) -> &'static str {
        match self {
            ExternalError::Download(_) => "download_error",
            ExternalError::Extract(_) => "extract_error",
            ExternalError::Ocr(_) => "ocr_error",
            ExternalError::Embedding(_) => "embedding_error",
            ExternalError::Generation(_) => "generation_error",
            ExternalError::MalformedOutput(_) => "malformed_output",
            ExternalError::Storage(_) => "storage_error",
        }
    }
}
