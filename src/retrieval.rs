//! Búsqueda semántica sobre los chunks almacenados.
//!
//! La similitud es coseno pura; la selección final aplica diversidad por
//! año para que ningún año reciente domine el resultado: el top-K ingenuo
//! sobre-representa el año con más chunks indexados (sesgo de volumen o de
//! recencia), y el análisis financiero multi-año necesita cobertura
//! histórica garantizada.

use anyhow::{anyhow, Result};
use neo4rs::Graph;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::warn;

use crate::chunk_store::{self, StoredChunk};
use crate::models::ChunkMatch;
use crate::registry::RegistryTables;

/// Chunks garantizados por cada año de la ventana objetivo.
pub const PER_YEAR_FLOOR: usize = 5;
/// Tamaño de la ventana de años objetivo (los más recientes).
pub const TARGET_WINDOW_YEARS: usize = 5;

/// Similitud coseno entre dos vectores. Vectores de longitud distinta son
/// un error duro: la similitud no está definida entre espacios diferentes.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(anyhow!(
            "Los vectores deben tener la misma longitud ({} != {})",
            a.len(),
            b.len()
        ));
    }

    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Años objetivo: los `TARGET_WINDOW_YEARS` más recientes, el actual
/// incluido.
pub fn target_years(current_year: i32) -> Vec<i32> {
    (current_year - (TARGET_WINDOW_YEARS as i32 - 1)..=current_year).collect()
}

/// Año de cuatro dígitos extraído de la fecha del documento; `None` va al
/// cubo "Desconocido".
pub fn extract_year(date: &str) -> Option<i32> {
    static YEAR_RE: OnceLock<Regex> = OnceLock::new();
    let re = YEAR_RE.get_or_init(|| Regex::new(r"\d{4}").unwrap());
    re.find(date).and_then(|m| m.as_str().parse().ok())
}

/// Candidato puntuado pendiente de selección.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: StoredChunk,
    pub similarity: f64,
}

/// Selección con diversidad por año.
///
/// Para cada año de la ventana objetivo se seleccionan incondicionalmente
/// los `PER_YEAR_FLOOR` mejores candidatos por similitud; las plazas
/// restantes hasta `top_k` se rellenan con los de mayor similitud global
/// aún no seleccionados (cualquier año, incluido "Desconocido"). La lista
/// final se reordena por similitud descendente, sin ids duplicados.
pub fn select_with_year_diversity(
    candidates: Vec<ScoredChunk>,
    top_k: usize,
    years: &[i32],
) -> Vec<ScoredChunk> {
    let mut sorted = candidates;
    sorted.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut selected: Vec<ScoredChunk> = Vec::new();
    let mut selected_ids: HashSet<String> = HashSet::new();

    // 1) Suelo por año objetivo
    for year in years {
        let mut taken = 0;
        for candidate in &sorted {
            if taken >= PER_YEAR_FLOOR || selected.len() >= top_k {
                break;
            }
            if selected_ids.contains(&candidate.chunk.id) {
                continue;
            }
            if extract_year(&candidate.chunk.metadata.document_date) == Some(*year) {
                selected_ids.insert(candidate.chunk.id.clone());
                selected.push(candidate.clone());
                taken += 1;
            }
        }
    }

    // 2) Relleno por similitud global
    for candidate in &sorted {
        if selected.len() >= top_k {
            break;
        }
        if selected_ids.insert(candidate.chunk.id.clone()) {
            selected.push(candidate.clone());
        }
    }

    // 3) Orden final por similitud
    selected.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    selected
}

/// Busca los chunks relevantes para un embedding de consulta.
///
/// Con filtro de emisor, los candidatos se traen bajo todos los ids
/// conocidos del emisor (canónico, alias e ids técnicos, vía el resolvedor
/// de identidad); sin filtro, sobre todo el corpus, siempre acotado por
/// `candidate_pool` para control de coste.
pub async fn search_relevant_chunks(
    graph: &Graph,
    tables: &RegistryTables,
    query_embedding: &[f64],
    issuer: Option<&str>,
    top_k: usize,
    candidate_pool: usize,
    current_year: i32,
) -> Result<Vec<ChunkMatch>> {
    let candidate_ids = match issuer {
        Some(raw) => match tables.resolve(raw) {
            Some(canonical) => Some(tables.candidate_ids(&canonical)),
            None => {
                warn!("Emisor desconocido en la búsqueda: '{raw}'; sin resultados");
                return Ok(Vec::new());
            }
        },
        None => None,
    };

    let stored =
        chunk_store::fetch_candidates(graph, candidate_ids.as_deref(), candidate_pool).await?;

    let mut scored = Vec::with_capacity(stored.len());
    for chunk in stored {
        let similarity = cosine_similarity(query_embedding, &chunk.embedding)?;
        scored.push(ScoredChunk { chunk, similarity });
    }

    let years = target_years(current_year);
    let selected = select_with_year_diversity(scored, top_k, &years);

    Ok(selected
        .into_iter()
        .map(|s| ChunkMatch {
            id: s.chunk.id,
            similarity: s.similarity,
            text: s.chunk.text,
            metadata: s.chunk.metadata,
        })
        .collect())
}

/// Construye el contexto del prompt a partir de los chunks relevantes.
pub fn build_context(matches: &[ChunkMatch]) -> String {
    matches
        .iter()
        .enumerate()
        .map(|(index, chunk)| {
            let excerpt: String = chunk.text.chars().take(800).collect();
            format!(
                "**Documento {}:**\n- Emisor: {}\n- Título: {}\n- Tipo: {}\n- Fecha: {}\n\nContenido:\n{}",
                index + 1,
                chunk.metadata.issuer_name,
                chunk.metadata.document_title,
                chunk.metadata.document_type,
                chunk.metadata.document_date,
                excerpt
            )
        })
        .collect::<Vec<_>>()
        .join("\n---\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;
    use approx::assert_relative_eq;

    #[test]
    fn similitud_de_un_vector_consigo_mismo_es_uno() {
        let v = vec![0.3, -0.2, 0.9, 0.1];
        assert_relative_eq!(cosine_similarity(&v, &v).unwrap(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn vectores_ortogonales_dan_cero() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]).unwrap();
        assert_relative_eq!(sim, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn vectores_opuestos_dan_menos_uno() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[-1.0, 0.0, 0.0]).unwrap();
        assert_relative_eq!(sim, -1.0, epsilon = 1e-9);
    }

    #[test]
    fn longitudes_distintas_son_error() {
        assert!(cosine_similarity(&[1.0, 2.0], &[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn extrae_el_anio_de_formatos_variados() {
        assert_eq!(extract_year("15/03/2024"), Some(2024));
        assert_eq!(extract_year("2023-12-31T00:00:00Z"), Some(2023));
        assert_eq!(extract_year("Informe Anual 2022"), Some(2022));
        assert_eq!(extract_year("sin fecha"), None);
    }

    #[test]
    fn ventana_objetivo_son_los_cinco_mas_recientes() {
        assert_eq!(target_years(2025), vec![2021, 2022, 2023, 2024, 2025]);
    }

    fn chunk(id: &str, date: &str, similarity: f64) -> ScoredChunk {
        ScoredChunk {
            chunk: StoredChunk {
                id: id.to_string(),
                chunk_index: 0,
                text: format!("texto {id}"),
                embedding: Vec::new(),
                metadata: ChunkMetadata {
                    issuer_name: "Banpro".to_string(),
                    document_title: format!("Doc {id}"),
                    document_url: String::new(),
                    document_date: date.to_string(),
                    document_type: "Estados Financieros".to_string(),
                    processed_at: String::new(),
                },
            },
            similarity,
        }
    }

    #[test]
    fn diversidad_garantiza_cinco_chunks_por_anio_objetivo() {
        let years = target_years(2025);
        let mut candidates = Vec::new();

        // Exactamente 5 candidatos por año objetivo, con similitudes bajas
        // para los años viejos...
        for (i, year) in years.iter().enumerate() {
            for j in 0..5 {
                candidates.push(chunk(
                    &format!("y{year}_{j}"),
                    &format!("31/12/{year}"),
                    0.10 + i as f64 * 0.01 + j as f64 * 0.001,
                ));
            }
        }
        // ...y 20 candidatos de años fuera de la ventana con similitud alta.
        for j in 0..20 {
            candidates.push(chunk(
                &format!("old_{j}"),
                "31/12/2015",
                0.90 - j as f64 * 0.001,
            ));
        }

        let selected = select_with_year_diversity(candidates, 40, &years);

        assert_eq!(selected.len(), 40);

        // Sin duplicados
        let ids: HashSet<&String> = selected.iter().map(|s| &s.chunk.id).collect();
        assert_eq!(ids.len(), 40);

        // Exactamente 5 por cada año objetivo pese a su baja similitud
        for year in &years {
            let count = selected
                .iter()
                .filter(|s| extract_year(&s.chunk.metadata.document_date) == Some(*year))
                .count();
            assert_eq!(count, 5, "el año {year} debe aportar exactamente 5 chunks");
        }

        // Las 15 plazas restantes van a los de mayor similitud (2015)
        let extras = selected
            .iter()
            .filter(|s| extract_year(&s.chunk.metadata.document_date) == Some(2015))
            .count();
        assert_eq!(extras, 15);

        // Orden final por similitud descendente
        for pair in selected.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
    }

    #[test]
    fn el_suelo_por_anio_elige_los_mejores_de_ese_anio() {
        let years = vec![2024];
        let candidates = vec![
            chunk("a", "2024", 0.2),
            chunk("b", "2024", 0.9),
            chunk("c", "2024", 0.5),
            chunk("d", "2024", 0.7),
            chunk("e", "2024", 0.6),
            chunk("f", "2024", 0.1),
        ];

        let selected = select_with_year_diversity(candidates, 5, &years);
        let ids: Vec<&str> = selected.iter().map(|s| s.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d", "e", "c", "a"]);
    }

    #[test]
    fn fechas_sin_anio_caen_al_cubo_desconocido_y_solo_entran_por_relleno() {
        let years = vec![2024];
        let candidates = vec![
            chunk("conocido", "2024", 0.1),
            chunk("desconocido", "sin fecha", 0.9),
        ];

        let selected = select_with_year_diversity(candidates, 2, &years);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].chunk.id, "desconocido");
    }
}
