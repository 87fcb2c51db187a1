//! Registro cerrado de emisores: whitelist, alias y mapeo de ids técnicos.
//!
//! La resolución de identidad es determinista y cerrada: un nombre crudo o
//! resuelve a un id canónico de la whitelist o devuelve `None`. Nunca se
//! adivina un emisor por defecto. Las tablas son datos (no control de
//! flujo) y se cargan desde un registro remoto con caché acotada por TTL y
//! respaldo estático si el remoto no está disponible.

use chrono::{DateTime, Duration, Utc};
use neo4rs::Graph;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::cache::Clock;
use crate::chunk_store;
use crate::models::{DocumentoCrudo, Emisor};

// ---------------------------------------------------------------------
// TABLAS BASE (RESPALDO ESTÁTICO)
// ---------------------------------------------------------------------

pub const WHITELIST: [&str; 7] = [
    "agricorp", "banpro", "bdf", "fama", "fdl", "fid", "horizonte",
];

/// Tabla de alias → id canónico. El orden importa: se evalúa de arriba a
/// abajo y gana la primera regla que dispara.
const ALIASES: &[(&str, &str)] = &[
    // Agricorp
    ("agri", "agricorp"),
    ("agri-corp", "agricorp"),
    ("agricorp", "agricorp"),
    ("corporacion-agricola", "agricorp"),
    ("corporacion agricola", "agricorp"),
    ("corporación agrícola", "agricorp"),
    ("corporacion-agricola-s-a", "agricorp"),
    // Banpro
    ("banpro", "banpro"),
    ("banco de la produccion", "banpro"),
    ("banco de la producción", "banpro"),
    ("banco-de-la-produccion", "banpro"),
    ("banco-de-la-producci-n", "banpro"),
    // BDF
    ("bdf", "bdf"),
    ("bancodefinanzas", "bdf"),
    ("banco de finanzas", "bdf"),
    ("banco-de-finanzas", "bdf"),
    // FAMA
    ("fama", "fama"),
    ("financiera fama", "fama"),
    ("financiera-fama", "fama"),
    // FDL
    ("fdl", "fdl"),
    ("financiera fdl", "fdl"),
    ("financiera-fdl", "fdl"),
    // FID
    ("fid", "fid"),
    ("fid sociedad anonima", "fid"),
    ("fid, sociedad anónima", "fid"),
    ("fid-sociedad-an-nima", "fid"),
    ("fid-s-a", "fid"),
    // Horizonte
    ("horizonte", "horizonte"),
    ("horizonte fondo de inversion", "horizonte"),
    ("horizonte-fondo-de-inversion", "horizonte"),
    ("fondo inversion horizonte", "horizonte"),
    ("fondo-de-inversion-horizonte", "horizonte"),
    (
        "horizonte-fondo-de-inversi-n-financiero-de-crecimiento-d-lares-no-diversificado",
        "horizonte",
    ),
];

/// Id canónico → ids técnicos usados históricamente como `issuerId` en el
/// almacén de chunks.
const EXTRACTION_MAPPING: &[(&str, &[&str])] = &[
    ("agricorp", &["agricorp", "agri-corp", "corporaci-n-agricola"]),
    ("banpro", &["banpro", "banco-de-la-producci-n"]),
    ("bdf", &["bdf", "banco-de-finanzas", "bancodefinanzas"]),
    ("fama", &["fama"]),
    ("fdl", &["fdl", "financiera-fdl"]),
    ("fid", &["fid", "fid-sociedad-an-nima", "fid-s-a"]),
    (
        "horizonte",
        &[
            "horizonte",
            "horizonte-fondo-de-inversi-n-financiero-de-crecimiento-d-lares-no-diversificado",
        ],
    ),
];

/// Metadatos de visualización e inicialización (seed del registro).
const ISSUER_METADATA: &[(&str, &str, &str, &str, &str)] = &[
    (
        "agricorp",
        "Corporación Agrícola S.A.",
        "AGRICORP",
        "Industria",
        "Principal empresa de agroindustria y distribución de productos básicos en Nicaragua.",
    ),
    (
        "banpro",
        "Banco de la Producción S.A.",
        "BANPRO",
        "Banca",
        "Institución financiera líder que ofrece servicios bancarios personales y corporativos.",
    ),
    (
        "bdf",
        "Banco de Finanzas S.A.",
        "BDF",
        "Banca",
        "Banco comercial especializado en préstamos hipotecarios y consumo.",
    ),
    (
        "fama",
        "Financiera FAMA S.A.",
        "FAMA",
        "Microfinanzas",
        "Institución financiera enfocada en microfinanzas y apoyo a la pequeña empresa.",
    ),
    (
        "fdl",
        "Financiera FDL",
        "FDL",
        "Microfinanzas",
        "Servicios financieros para sectores rurales y urbanos de bajos ingresos.",
    ),
    (
        "fid",
        "FID, Sociedad Anónima (Invercasa)",
        "FID",
        "Servicios Financieros",
        "Sociedad anónima dedicada a la inversión y gestión de activos.",
    ),
    (
        "horizonte",
        "Fondo de Inversión Horizonte",
        "HORIZONTE",
        "Fondos de Inversión",
        "Fondo de inversión financiero de crecimiento en dólares no diversificado.",
    ),
];

// ---------------------------------------------------------------------
// TABLAS RESOLUBLES (ESTÁTICAS O REMOTAS)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetaEmisor {
    pub name: String,
    pub acronym: String,
    pub sector: String,
    #[serde(default)]
    pub description: String,
}

/// Conjunto completo de tablas del registro. Puede venir del registro
/// remoto (`:SystemConfig {id: 'issuers'}`) o del respaldo estático.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryTables {
    pub whitelist: Vec<String>,
    pub aliases: Vec<(String, String)>,
    #[serde(rename = "extractionMapping")]
    pub extraction_mapping: HashMap<String, Vec<String>>,
    pub metadata: HashMap<String, MetaEmisor>,
}

impl RegistryTables {
    /// Respaldo estático compilado en el binario.
    pub fn fallback() -> Self {
        Self {
            whitelist: WHITELIST.iter().map(|s| s.to_string()).collect(),
            aliases: ALIASES
                .iter()
                .map(|(a, c)| (a.to_string(), c.to_string()))
                .collect(),
            extraction_mapping: EXTRACTION_MAPPING
                .iter()
                .map(|(id, ids)| {
                    (
                        id.to_string(),
                        ids.iter().map(|s| s.to_string()).collect(),
                    )
                })
                .collect(),
            metadata: ISSUER_METADATA
                .iter()
                .map(|(id, name, acronym, sector, description)| {
                    (
                        id.to_string(),
                        MetaEmisor {
                            name: name.to_string(),
                            acronym: acronym.to_string(),
                            sector: sector.to_string(),
                            description: description.to_string(),
                        },
                    )
                })
                .collect(),
        }
    }

    // -----------------------------------------------------------------
    // RESOLUCIÓN DE IDENTIDAD
    // -----------------------------------------------------------------

    /// Resuelve un nombre o id crudo de emisor al id canónico.
    ///
    /// Orden de reglas: (1) whitelist exacta, (2) alias exacto o por
    /// subcadena, (3) ids técnicos por subcadena en ambas direcciones.
    /// Devuelve `None` cuando ninguna regla dispara: el llamante debe
    /// tratarlo como "emisor desconocido" y saltar la unidad de trabajo.
    pub fn resolve(&self, raw: &str) -> Option<String> {
        if raw.is_empty() || raw == "Desconocido" {
            return None;
        }

        let input = match_key(raw);
        if input.is_empty() {
            return None;
        }

        // 1) Whitelist directa
        if let Some(id) = self.whitelist.iter().find(|id| match_key(id) == input) {
            return Some(id.clone());
        }

        // 2) Alias (normalizados): igualdad o subcadena
        for (alias, canonical) in &self.aliases {
            let norm_alias = match_key(alias);
            if norm_alias == input || input.contains(norm_alias.as_str()) {
                return Some(canonical.clone());
            }
        }

        // 3) Mapeo de ids técnicos: subcadena en ambas direcciones
        for (canonical, technical) in &self.extraction_mapping {
            for tech in technical {
                let norm_tech = match_key(tech);
                if input.contains(norm_tech.as_str()) || norm_tech.contains(input.as_str()) {
                    return Some(canonical.clone());
                }
            }
        }

        None
    }

    /// Alias conocidos de un id canónico (sin incluir el propio id).
    pub fn aliases_for(&self, canonical: &str) -> Vec<String> {
        self.aliases
            .iter()
            .filter(|(alias, id)| id == canonical && alias != canonical)
            .map(|(alias, _)| alias.clone())
            .collect()
    }

    /// Ids técnicos bajo los que se almacenaron chunks de este emisor.
    pub fn technical_ids(&self, canonical: &str) -> Vec<String> {
        self.extraction_mapping
            .get(canonical)
            .cloned()
            .unwrap_or_else(|| vec![canonical.to_string()])
    }

    /// Conjunto de ids bajo los que pueden existir chunks del emisor:
    /// canónico + alias + ids técnicos, sin duplicados.
    pub fn candidate_ids(&self, canonical: &str) -> Vec<String> {
        let mut ids = vec![canonical.to_string()];
        ids.extend(self.aliases_for(canonical));
        ids.extend(self.technical_ids(canonical));
        ids.sort();
        ids.dedup();
        ids
    }

    /// Consolida emisores crudos (de scraping) en entidades únicas de la
    /// whitelist, fusionando documentos por url.
    pub fn consolidate(&self, raw_issuers: Vec<Emisor>) -> Vec<Emisor> {
        let mut by_id: HashMap<String, Emisor> = HashMap::new();

        // Los nombres más largos primero: un nombre completo fija los
        // metadatos antes de que lleguen las variantes abreviadas.
        let mut sorted = raw_issuers;
        sorted.sort_by(|a, b| b.name.len().cmp(&a.name.len()));

        for raw in sorted {
            let base = normalize_base(&raw.name);
            let Some(canonical) = self.resolve(&base) else {
                continue;
            };

            match by_id.entry(canonical.clone()) {
                Entry::Vacant(slot) => {
                    let meta = self.metadata.get(&canonical);
                    slot.insert(Emisor {
                        id: canonical.clone(),
                        name: meta.map(|m| m.name.clone()).unwrap_or(raw.name),
                        acronym: meta
                            .map(|m| m.acronym.clone())
                            .unwrap_or_else(|| canonical.to_uppercase()),
                        sector: if raw.sector.is_empty() {
                            meta.map(|m| m.sector.clone()).unwrap_or_default()
                        } else {
                            raw.sector
                        },
                        description: meta
                            .map(|m| m.description.clone())
                            .unwrap_or(raw.description),
                        ..raw_with_docs(raw.detail_url, raw.documents)
                    });
                }
                Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    merge_documents(&mut existing.documents, raw.documents);
                    if existing.sector.is_empty() && !raw.sector.is_empty() {
                        existing.sector = raw.sector;
                    }
                    if existing.detail_url.is_none() {
                        existing.detail_url = raw.detail_url;
                    }
                }
            }
        }

        let mut result: Vec<Emisor> = by_id.into_values().collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }
}

fn raw_with_docs(detail_url: Option<String>, documents: Vec<DocumentoCrudo>) -> Emisor {
    Emisor {
        id: String::new(),
        name: String::new(),
        acronym: String::new(),
        sector: String::new(),
        description: String::new(),
        detail_url,
        is_active: true,
        documents_processed: 0,
        last_processed: None,
        documents,
    }
}

/// Añade documentos nuevos deduplicando por url (clave de identidad).
pub fn merge_documents(existing: &mut Vec<DocumentoCrudo>, incoming: Vec<DocumentoCrudo>) {
    for doc in incoming {
        if !existing.iter().any(|d| d.url == doc.url) {
            existing.push(doc);
        }
    }
}

// ---------------------------------------------------------------------
// NORMALIZACIÓN
// ---------------------------------------------------------------------

/// Normaliza un nombre a su token base: minúsculas, sin tildes, cortado en
/// el primer separador (" - ", "(", ",") y sin sufijos legales.
pub fn normalize_base(name: &str) -> String {
    let mut normalized = strip_diacritics(&name.to_lowercase());

    for sep in [" - ", " – ", " — ", "(", ","] {
        if let Some(idx) = normalized.find(sep) {
            normalized.truncate(idx);
        }
    }

    normalized = normalized
        .trim()
        .trim_end_matches("s.a.")
        .trim_end_matches("s.a")
        .trim()
        .to_string();

    normalized
}

/// Clave de comparación: normalización base más eliminación de todo lo que
/// no sea alfanumérico, para que "banco-de-la-producci-n" y
/// "Banco de la Producción" colisionen.
fn match_key(raw: &str) -> String {
    strip_diacritics(&raw.to_lowercase())
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Elimina las tildes y diéresis del español (y la eñe a ene para las
/// claves de comparación slug).
pub fn strip_diacritics(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

// ---------------------------------------------------------------------
// RESOLUCIÓN DE CONFIGURACIÓN (REMOTA / CACHÉ / ESTÁTICA)
// ---------------------------------------------------------------------

/// Regla de precedencia pura: caché vigente > remoto > respaldo estático.
/// La caché se considera vigente si su edad es estrictamente menor que el
/// TTL en el instante `now`.
pub fn resolve_registry_config(
    remote: Option<RegistryTables>,
    cached: Option<(RegistryTables, DateTime<Utc>)>,
    fallback: RegistryTables,
    now: DateTime<Utc>,
    ttl_secs: u64,
) -> RegistryTables {
    if let Some((tables, cached_at)) = cached {
        if now - cached_at < Duration::seconds(ttl_secs as i64) {
            return tables;
        }
    }
    match remote {
        Some(tables) => tables,
        None => fallback,
    }
}

/// Acceso compartido a las tablas del registro con caché TTL y carga
/// remota perezosa.
#[derive(Clone)]
pub struct RegistryHandle {
    cached: Arc<Mutex<Option<(RegistryTables, DateTime<Utc>)>>>,
    clock: Arc<dyn Clock>,
    ttl_secs: u64,
}

impl RegistryHandle {
    pub fn new(clock: Arc<dyn Clock>, ttl_secs: u64) -> Self {
        Self {
            cached: Arc::new(Mutex::new(None)),
            clock,
            ttl_secs,
        }
    }

    /// Devuelve las tablas vigentes. Si la caché venció intenta recargar
    /// desde el registro remoto; si el remoto no está disponible, degrada
    /// al respaldo estático sin fallar.
    pub async fn tables(&self, graph: &Graph) -> RegistryTables {
        let now = self.clock.now();
        let cached = self.cached.lock().unwrap().clone();

        if let Some((tables, cached_at)) = &cached {
            if now - *cached_at < Duration::seconds(self.ttl_secs as i64) {
                return tables.clone();
            }
        }

        let remote = match chunk_store::load_registry_tables(graph).await {
            Ok(found) => {
                if found.is_some() {
                    info!("🔄 Tablas del registro de emisores actualizadas desde Neo4j");
                }
                found
            }
            Err(e) => {
                warn!("No se pudo cargar el registro remoto, usando respaldo local: {e}");
                None
            }
        };

        let tables = resolve_registry_config(
            remote,
            cached,
            RegistryTables::fallback(),
            now,
            self.ttl_secs,
        );

        *self.cached.lock().unwrap() = Some((tables.clone(), now));
        tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> RegistryTables {
        RegistryTables::fallback()
    }

    #[test]
    fn resuelve_todas_las_variantes_de_banpro_al_mismo_id() {
        let t = tables();
        assert_eq!(t.resolve("banpro"), Some("banpro".to_string()));
        assert_eq!(t.resolve("BANPRO"), Some("banpro".to_string()));
        assert_eq!(
            t.resolve("Banco de la Producción"),
            Some("banpro".to_string())
        );
        assert_eq!(
            t.resolve("banco-de-la-producci-n"),
            Some("banpro".to_string())
        );
    }

    #[test]
    fn la_resolucion_es_idempotente_sobre_su_resultado() {
        let t = tables();
        for raw in ["Financiera FAMA S.A.", "fid-sociedad-an-nima", "AGRICORP"] {
            let canonical = t.resolve(raw).unwrap();
            assert_eq!(t.resolve(&canonical), Some(canonical.clone()));
        }
    }

    #[test]
    fn desconocido_devuelve_none_sin_mapear_por_defecto() {
        let t = tables();
        assert_eq!(t.resolve("Desconocido"), None);
        assert_eq!(t.resolve(""), None);
        assert_eq!(t.resolve("Banco Inexistente de Pruebas"), None);
    }

    #[test]
    fn ids_tecnicos_incluyen_los_slugs_historicos() {
        let t = tables();
        let ids = t.technical_ids("bdf");
        assert!(ids.contains(&"banco-de-finanzas".to_string()));
        let candidates = t.candidate_ids("banpro");
        assert!(candidates.contains(&"banpro".to_string()));
        assert!(candidates.contains(&"banco-de-la-producci-n".to_string()));
    }

    #[test]
    fn normalize_base_corta_separadores_y_sufijos() {
        assert_eq!(normalize_base("Banco de Finanzas, S.A."), "banco de finanzas");
        assert_eq!(
            normalize_base("Corporación Agrícola (AGRICORP)"),
            "corporacion agricola"
        );
        assert_eq!(normalize_base("FID – Invercasa"), "fid");
    }

    #[test]
    fn consolidate_fusiona_duplicados_y_deduplica_documentos() {
        let t = tables();
        let doc = |url: &str| DocumentoCrudo {
            title: format!("Doc {url}"),
            url: url.to_string(),
            date: "01/01/2024".to_string(),
            doc_type: "Estados Financieros".to_string(),
        };
        let raw = |name: &str, docs: Vec<DocumentoCrudo>| Emisor {
            id: String::new(),
            name: name.to_string(),
            acronym: String::new(),
            sector: String::new(),
            description: String::new(),
            detail_url: None,
            is_active: true,
            documents_processed: 0,
            last_processed: None,
            documents: docs,
        };

        let consolidated = t.consolidate(vec![
            raw("Banco de la Producción", vec![doc("/a.pdf"), doc("/b.pdf")]),
            raw("BANPRO", vec![doc("/b.pdf"), doc("/c.pdf")]),
            raw("Entidad Fuera de Whitelist", vec![doc("/x.pdf")]),
        ]);

        assert_eq!(consolidated.len(), 1);
        let banpro = &consolidated[0];
        assert_eq!(banpro.id, "banpro");
        assert_eq!(banpro.name, "Banco de la Producción S.A.");
        assert_eq!(banpro.documents.len(), 3);
    }

    #[test]
    fn precedencia_cache_vigente_gana_al_remoto() {
        let now = Utc::now();
        let mut cached = tables();
        cached.whitelist.push("cacheado".to_string());
        let mut remote = tables();
        remote.whitelist.push("remoto".to_string());

        let resolved = resolve_registry_config(
            Some(remote),
            Some((cached.clone(), now)),
            tables(),
            now,
            300,
        );
        assert_eq!(resolved, cached);
    }

    #[test]
    fn precedencia_cache_vencida_usa_remoto_y_sin_remoto_el_respaldo() {
        let now = Utc::now();
        let stale_at = now - Duration::seconds(301);
        let mut cached = tables();
        cached.whitelist.push("cacheado".to_string());
        let mut remote = tables();
        remote.whitelist.push("remoto".to_string());

        let resolved = resolve_registry_config(
            Some(remote.clone()),
            Some((cached.clone(), stale_at)),
            tables(),
            now,
            300,
        );
        assert_eq!(resolved, remote);

        let resolved = resolve_registry_config(None, Some((cached, stale_at)), tables(), now, 300);
        assert_eq!(resolved, tables());
    }
}
