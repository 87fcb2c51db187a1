//! Abstracción sobre Rig para trabajar con distintos proveedores de LLM.
//! De momento se implementa OpenAI; Gemini/Ollama quedan preparados para el
//! futuro. Concentra embeddings, respuesta RAG y extracción estructurada
//! bajo esquema JSON.

use crate::config::{AppConfig, LlmProvider};
use crate::errors::ExternalError;
use crate::models::{DigestFinanciero, MetricasEmisor, PuntoHistorico};
use anyhow::Result;
use rig::completion::Prompt;
use rig::embeddings::EmbeddingModel;
use serde::de::DeserializeOwned;

/// Resultado de un embedding de un chunk.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub id: String,
    pub text: String,
    pub vector: Vec<f64>,
}

/// Gestor de LLMs y embeddings.
#[derive(Debug, Clone)]
pub struct LlmManager {
    pub provider: LlmProvider,
    pub embedding_model: String,
    pub chat_model: String,
    pub extraction_model: String,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        Ok(Self {
            provider: cfg.llm_provider.clone(),
            embedding_model: cfg.llm_embedding_model.clone(),
            chat_model: cfg.llm_chat_model.clone(),
            extraction_model: cfg.llm_extraction_model.clone(),
        })
    }

    // ---------------------------------------------------------------------
    // EMBEDDINGS
    // ---------------------------------------------------------------------

    /// Calcula embeddings para una lista de (id, texto).
    ///
    /// Nota: sólo implementado para OpenAI. Para otros proveedores se
    /// podrían añadir ramas adicionales al `match`.
    pub async fn embed_chunks(
        &self,
        chunks: &[(String, String)],
    ) -> Result<Vec<EmbeddedChunk>, ExternalError> {
        match self.provider {
            LlmProvider::OpenAI => self.embed_with_openai(chunks).await,
            ref other => Err(ExternalError::Embedding(format!(
                "Proveedor LLM {other:?} aún no implementado para embeddings"
            ))),
        }
    }

    /// Embedding de una consulta individual.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f64>, ExternalError> {
        let embedded = self
            .embed_chunks(&[("query".to_string(), text.to_string())])
            .await?;
        embedded
            .into_iter()
            .next()
            .map(|e| e.vector)
            .ok_or_else(|| {
                ExternalError::Embedding("No se pudo generar embedding de la query".to_string())
            })
    }

    async fn embed_with_openai(
        &self,
        chunks: &[(String, String)],
    ) -> Result<Vec<EmbeddedChunk>, ExternalError> {
        use rig::client::EmbeddingsClient as _;
        use rig::providers::openai::{self, TEXT_EMBEDDING_3_SMALL};

        let client = openai::Client::from_env();

        let model_name = if self.embedding_model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.embedding_model.as_str()
        };

        let embedding_model = client.embedding_model(model_name);
        let texts: Vec<String> = chunks.iter().map(|(_, text)| text.clone()).collect();

        let embeddings = embedding_model
            .embed_texts(texts)
            .await
            .map_err(|e| ExternalError::Embedding(e.to_string()))?;

        if embeddings.len() != chunks.len() {
            return Err(ExternalError::Embedding(format!(
                "Número de embeddings ({}) distinto al número de chunks ({})",
                embeddings.len(),
                chunks.len()
            )));
        }

        let mut result = Vec::new();
        for ((id, text), emb) in chunks.iter().zip(embeddings.iter()) {
            result.push(EmbeddedChunk {
                id: id.clone(),
                text: text.clone(),
                vector: emb.vec.clone(),
            });
        }

        Ok(result)
    }

    // ---------------------------------------------------------------------
    // CHAT / COMPLETION
    // ---------------------------------------------------------------------

    /// Responde una consulta de analista usando el contexto recuperado
    /// (concatenación de chunks relevantes con sus metadatos).
    pub async fn answer_with_context(
        &self,
        question: &str,
        context: &str,
    ) -> Result<String, ExternalError> {
        match self.provider {
            LlmProvider::OpenAI => self.answer_with_openai(question, context).await,
            ref other => Err(ExternalError::Generation(format!(
                "Proveedor LLM {other:?} aún no implementado para chat"
            ))),
        }
    }

    async fn answer_with_openai(
        &self,
        question: &str,
        context: &str,
    ) -> Result<String, ExternalError> {
        use rig::client::CompletionClient as _;
        use rig::providers::openai;

        const SYSTEM_PROMPT: &str = r#"
Eres un Analista Financiero Senior con acceso a la base documental del mercado de valores de Nicaragua.
Respondes en español, de forma profesional, analítica y directa.
Instrucciones críticas:
1. Citación obligatoria: por cada dato numérico o afirmación clave indica el documento y el año (ej: [Informe Anual 2022]).
2. Estructura temporal: si la pregunta implica evolución en el tiempo, usa una tabla Markdown para comparar los años disponibles.
3. Integridad de datos: sólo puedes usar la información del contexto suministrado. Si un dato no está, indícalo explícitamente; no inventes cifras.
"#;

        let client = openai::Client::from_env();

        let model_name = if self.chat_model.is_empty() {
            "gpt-4o-mini"
        } else {
            self.chat_model.as_str()
        };

        let full_context = format!(
            "Contexto de documentos:\n{}\n\nPregunta del analista:\n{}",
            context, question
        );

        let agent = client
            .agent(model_name)
            .preamble(SYSTEM_PROMPT)
            .context(&full_context)
            .build();

        let answer = agent
            .prompt(question)
            .await
            .map_err(|e| ExternalError::Generation(e.to_string()))?;
        Ok(answer)
    }

    // ---------------------------------------------------------------------
    // EXTRACCIÓN ESTRUCTURADA
    // ---------------------------------------------------------------------

    /// Lanza un prompt de extracción y parsea la respuesta como `T`.
    ///
    /// La respuesta del modelo se limpia (bloques ```json, comas finales,
    /// caracteres de control) antes de parsear. Si aun así el JSON es
    /// inválido devuelve `MalformedOutput`; la frontera de la unidad de
    /// trabajo decide el objeto mínimo de respaldo.
    pub async fn generate_structured<T>(&self, prompt: &str) -> Result<T, ExternalError>
    where
        T: DeserializeOwned,
    {
        use rig::client::CompletionClient as _;
        use rig::providers::openai;

        if !matches!(self.provider, LlmProvider::OpenAI) {
            return Err(ExternalError::Generation(format!(
                "Proveedor LLM {:?} aún no implementado para extracción",
                self.provider
            )));
        }

        let client = openai::Client::from_env();
        let model_name = if self.extraction_model.is_empty() {
            "gpt-4o-mini"
        } else {
            self.extraction_model.as_str()
        };

        let agent = client
            .agent(model_name)
            .preamble("Devuelves únicamente JSON válido, sin explicaciones ni markdown.")
            .build();

        let response = agent
            .prompt(prompt)
            .await
            .map_err(|e| ExternalError::Generation(e.to_string()))?;

        let cleaned = clean_model_json(&response);
        serde_json::from_str::<T>(&cleaned).map_err(|e| {
            ExternalError::MalformedOutput(format!(
                "{e}. Respuesta: '{}'",
                response.chars().take(500).collect::<String>()
            ))
        })
    }

    /// Extrae métricas estructuradas bajo el esquema de `MetricasEmisor`.
    pub async fn extract_metrics(
        &self,
        issuer_id: &str,
        issuer_name: &str,
        context: &str,
    ) -> Result<MetricasEmisor, ExternalError> {
        let schema = schemars::schema_for!(MetricasEmisor);
        let schema_json = serde_json::to_string_pretty(&schema)
            .map_err(|e| ExternalError::Generation(e.to_string()))?;

        let prompt = format!(
            r#"
Eres un CFA Senior especializado en el mercado de valores de Nicaragua.
Tu misión es extraer métricas financieras precisas para el emisor "{issuer_name}" (ID: {issuer_id}) basándote EXCLUSIVAMENTE en el contexto proveído.

REGLAS DE EXTRACCIÓN:
1. NO CONVIERTAS MONEDAS. Extrae los valores tal cual aparecen.
2. Detecta la moneda: "C$", "Córdobas" -> NIO. "US$", "Dólares" -> USD. Si la tabla dice "Cifras en Miles de Córdobas" la moneda es NIO.
3. SIEMPRE prioriza los ESTADOS FINANCIEROS AUDITADOS más recientes sobre los informes de calificación, aunque el informe sea más nuevo. El campo "metadata.periodo" es la fecha de CORTE de los estados financieros, no la del informe que los cita.
4. Si no existen estados auditados, extrae de los informes de calificación; si no hay tablas claras busca en el texto narrativo ("El pasivo alcanzó C$19,469 millones" -> 19469).
5. Si un dato no existe, usa null. NO inventes.

CONTEXTO:
{context}

SALIDA: un único objeto JSON válido conforme a este esquema:
{schema_json}
"#
        );

        self.generate_structured(&prompt).await
    }

    /// Reconstruye la serie histórica de los años objetivo a partir de
    /// columnas comparativas de reportes posteriores.
    pub async fn extract_history(
        &self,
        issuer_name: &str,
        target_years: &[i32],
        context: &str,
    ) -> Result<Vec<PuntoHistorico>, ExternalError> {
        let years: Vec<String> = target_years.iter().map(|y| y.to_string()).collect();
        let years_list = years.join(", ");

        let prompt = format!(
            r#"
Eres un analista financiero Senior (CFA). Tu misión es reconstruir la serie histórica del emisor "{issuer_name}" para los años: {years_list}.

TAREA:
Extrae Activos Totales, Utilidad Neta y Patrimonio para cada uno de los años solicitados.

REGLAS DE ORO:
1. Prioridad auditada: los estados financieros auditados son la fuente de verdad.
2. DATOS COMPARATIVOS: usa las columnas comparativas (la columna "2023" de un reporte 2024) para reconstruir el pasado.
3. Para el año en curso busca reportes trimestrales.
4. Monedas: extrae el valor bruto, sin convertir.

CONTEXTO FINANCIERO (fragmentos de múltiples reportes):
{context}

FORMATO JSON (ARRAY, sin markdown):
[
  {{ "period": "2023", "date": "2023-12-31", "activosTotales": 123.4, "utilidadNeta": 5.6, "patrimonio": 78.9, "fuente": "..." }}
]
"#
        );

        self.generate_structured(&prompt).await
    }

    /// Extracción estructurada condicional de un estado financiero:
    /// métricas compactas más un resumen Markdown que se comprime en el
    /// super chunk.
    pub async fn extract_financial_digest(
        &self,
        title: &str,
        text: &str,
    ) -> Result<DigestFinanciero, ExternalError> {
        let schema = schemars::schema_for!(DigestFinanciero);
        let schema_json = serde_json::to_string_pretty(&schema)
            .map_err(|e| ExternalError::Generation(e.to_string()))?;

        // El texto completo puede exceder la ventana del modelo; el corte
        // por caracteres es suficiente porque las tablas clave van al
        // principio de los estados financieros.
        let bounded: String = text.chars().take(200_000).collect();

        let prompt = format!(
            r#"
Eres un analista financiero. El documento "{title}" es un estado financiero del mercado de valores de Nicaragua.

TAREA:
1. Extrae las métricas financieras clave (tal cual aparecen, sin convertir monedas; null si no existen).
2. Redacta "resumen_markdown": un digest limpio en Markdown del documento, con las tablas de balance y resultados principales, apto para recuperación semántica.

DOCUMENTO:
{bounded}

SALIDA: un único objeto JSON válido conforme a este esquema:
{schema_json}
"#
        );

        self.generate_structured(&prompt).await
    }
}

/// Limpia la respuesta del LLM para asegurar que sólo contenga el JSON:
/// quita vallas de código, recorta hasta el primer objeto/array balanceado,
/// elimina caracteres de control y comas finales.
pub fn clean_model_json(raw: &str) -> String {
    let mut text = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
        .to_string();

    let first_brace = text.find('{');
    let last_brace = text.rfind('}');
    let first_bracket = text.find('[');
    let last_bracket = text.rfind(']');

    text = match (first_brace, last_brace, first_bracket, last_bracket) {
        (Some(fb), Some(lb), Some(fa), _) if fb < fa => text[fb..=lb].to_string(),
        (Some(fb), Some(lb), None, _) => text[fb..=lb].to_string(),
        (_, _, Some(fa), Some(la)) => text[fa..=la].to_string(),
        _ => text,
    };

    // Caracteres de control que rompen serde_json
    text = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();

    // Comas finales antes de cierre
    let mut cleaned = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ',' {
            let mut lookahead = chars.clone();
            let mut next_significant = None;
            for n in lookahead.by_ref() {
                if !n.is_whitespace() {
                    next_significant = Some(n);
                    break;
                }
            }
            if matches!(next_significant, Some('}') | Some(']')) {
                continue;
            }
        }
        cleaned.push(c);
    }

    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricasEmisor;

    #[test]
    fn limpia_vallas_de_codigo() {
        let raw = "```json\n{\"capital\": {\"activosTotales\": 100.0}}\n```";
        let cleaned = clean_model_json(raw);
        let parsed: MetricasEmisor = serde_json::from_str(&cleaned).unwrap();
        assert_eq!(parsed.capital.activos_totales, Some(100.0));
    }

    #[test]
    fn recorta_texto_alrededor_del_json() {
        let raw = "Claro, aquí está el resultado:\n{\"pasivos\": 5.0} espero que sirva";
        let cleaned = clean_model_json(raw);
        assert_eq!(cleaned, "{\"pasivos\": 5.0}");
    }

    #[test]
    fn elimina_comas_finales() {
        let raw = "{\"a\": 1, \"b\": [1, 2, ], }";
        let cleaned = clean_model_json(raw);
        let parsed: serde_json::Value = serde_json::from_str(&cleaned).unwrap();
        assert_eq!(parsed["b"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn prefiere_array_cuando_precede_al_objeto() {
        let raw = "[{\"period\": \"2023\"}] texto sobrante";
        let cleaned = clean_model_json(raw);
        assert!(cleaned.starts_with('['));
        assert!(cleaned.ends_with(']'));
    }
}
