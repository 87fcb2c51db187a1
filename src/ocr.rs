//! OCR para PDFs escaneados que el extractor primario no puede leer.
//!
//! Cadena de respaldo: servicio OCR configurado → modelo de visión. Si
//! ambos fallan, el documento degrada a cero chunks y el lote continúa.

use base64::Engine;
use reqwest::Client;
use serde_json::json;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::errors::ExternalError;

/// Heurística para detectar un PDF escaneado (basado en imágenes) a partir
/// del texto que devolvió el extractor primario: texto demasiado corto o
/// con una proporción alfanumérica por debajo del umbral.
pub fn appears_scanned(text: &str) -> bool {
    const MIN_TEXT_LEN: usize = 50;
    const MIN_ALPHANUMERIC_RATIO: f64 = 0.6;

    let total = text.chars().count();
    if total < MIN_TEXT_LEN {
        return true;
    }

    let alphanumeric = text
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || "áéíóúñÁÉÍÓÚÑ".contains(*c))
        .count();

    (alphanumeric as f64 / total as f64) < MIN_ALPHANUMERIC_RATIO
}

/// Extrae el texto de un PDF escaneado.
///
/// Primero intenta el servicio OCR configurado; si falla (o no hay
/// endpoint) recurre al modelo de visión como segundo respaldo.
pub async fn extract_text_with_ocr(
    cfg: &AppConfig,
    http: &Client,
    pdf_bytes: &[u8],
    document_title: &str,
) -> Result<String, ExternalError> {
    if let Some(url) = &cfg.ocr_service_url {
        match ocr_service(http, url, pdf_bytes).await {
            Ok(text) => {
                info!(
                    "[OCR] Extraídos {} caracteres para '{}'",
                    text.chars().count(),
                    document_title
                );
                return Ok(text);
            }
            Err(e) => {
                error!(
                    "[OCR] Servicio OCR falló para '{}', intentando modelo de visión: {}",
                    document_title, e
                );
            }
        }
    }

    vision_model_ocr(cfg, http, pdf_bytes, document_title).await
}

async fn ocr_service(
    http: &Client,
    url: &str,
    pdf_bytes: &[u8],
) -> Result<String, ExternalError> {
    let response = http
        .post(url)
        .header("Content-Type", "application/pdf")
        .body(pdf_bytes.to_vec())
        .send()
        .await
        .map_err(|e| ExternalError::Ocr(e.to_string()))?;

    if !response.status().is_success() {
        return Err(ExternalError::Ocr(format!(
            "el servicio OCR respondió {}",
            response.status()
        )));
    }

    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| ExternalError::Ocr(e.to_string()))?;

    let text = body
        .get("text")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .trim()
        .to_string();

    if text.is_empty() {
        return Err(ExternalError::Ocr(
            "el servicio OCR devolvió texto vacío".to_string(),
        ));
    }

    Ok(text)
}

/// Segundo respaldo: el modelo de visión lee el PDF directamente.
async fn vision_model_ocr(
    cfg: &AppConfig,
    http: &Client,
    pdf_bytes: &[u8],
    document_title: &str,
) -> Result<String, ExternalError> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| ExternalError::Ocr("Falta OPENAI_API_KEY para el OCR de visión".to_string()))?;

    let encoded = base64::engine::general_purpose::STANDARD.encode(pdf_bytes);

    const OCR_PROMPT: &str = "Eres un asistente experto en OCR. Extrae TODO el contenido de texto \
legible de este PDF financiero. Mantén la estructura de tablas y el orden de los párrafos. \
Si el documento está en español, extráelo en español. SALIDA: solo el texto extraído.";

    let payload = json!({
        "model": cfg.llm_extraction_model,
        "messages": [{
            "role": "user",
            "content": [
                { "type": "text", "text": OCR_PROMPT },
                {
                    "type": "file",
                    "file": {
                        "filename": "documento.pdf",
                        "file_data": format!("data:application/pdf;base64,{encoded}")
                    }
                }
            ]
        }]
    });

    let response = http
        .post("https://api.openai.com/v1/chat/completions")
        .bearer_auth(api_key)
        .json(&payload)
        .send()
        .await
        .map_err(|e| ExternalError::Ocr(e.to_string()))?;

    if !response.status().is_success() {
        return Err(ExternalError::Ocr(format!(
            "el modelo de visión respondió {}",
            response.status()
        )));
    }

    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| ExternalError::Ocr(e.to_string()))?;

    let text = body["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or_default()
        .trim()
        .to_string();

    if text.is_empty() {
        return Err(ExternalError::Ocr(
            "respuesta vacía del modelo de visión".to_string(),
        ));
    }

    info!(
        "[OCR visión] Extraídos {} caracteres para '{}'",
        text.chars().count(),
        document_title
    );
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texto_corto_se_considera_escaneado() {
        assert!(appears_scanned(""));
        assert!(appears_scanned("pág. 1"));
    }

    #[test]
    fn texto_normal_no_se_considera_escaneado() {
        let text = "Estados financieros auditados al 31 de diciembre de 2024. \
                    Activos totales: 1,500 millones de córdobas.";
        assert!(!appears_scanned(text));
    }

    #[test]
    fn basura_no_alfanumerica_se_considera_escaneada() {
        let garbage = "�?¿*+~^^```|||---___///\\\\...,,,;;;:::!!!¡¡¡(((())))===&&&%%%$$$###"
            .repeat(3);
        assert!(appears_scanned(&garbage));
    }

    #[test]
    fn el_espanol_acentuado_cuenta_como_alfanumerico() {
        let text = "Camión añejo índice período económico güisqui ".repeat(5);
        assert!(!appears_scanned(&text));
    }
}
