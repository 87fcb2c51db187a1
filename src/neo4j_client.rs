use crate::config::AppConfig;
use anyhow::Result;
use neo4rs::{query, Graph};
use tracing::info;
use url::Url;

pub async fn connect_from_config(cfg: &AppConfig) -> Result<Graph> {
    let url = Url::parse(&cfg.neo4j_uri)?;
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(7687);
    let addr = format!("{host}:{port}");

    info!("Conectando a Neo4j en {addr}...");
    let graph = Graph::new(&addr, &cfg.neo4j_user, &cfg.neo4j_password).await?;
    info!("Conexión a Neo4j OK");
    Ok(graph)
}

/// Crea constraints básicos para las etiquetas usadas en el almacén:
/// :Emisor, :Chunk, :MetricSnapshot, :MetricPeriod, :HistoryPoint y
/// :SystemConfig (registro de configuración remota).
pub async fn ensure_schema(graph: &Graph) -> Result<()> {
    let statements = [
        // Emisor.id único (id canónico, inmutable)
        "CREATE CONSTRAINT emisor_id IF NOT EXISTS
         FOR (e:Emisor)
         REQUIRE e.id IS UNIQUE",
        // Chunk.id único (clave derivada issuerId_documentId_chunk_idx)
        "CREATE CONSTRAINT chunk_id IF NOT EXISTS
         FOR (c:Chunk)
         REQUIRE c.id IS UNIQUE",
        // Un snapshot de métricas por emisor
        "CREATE CONSTRAINT metric_snapshot_issuer IF NOT EXISTS
         FOR (m:MetricSnapshot)
         REQUIRE m.issuer_id IS UNIQUE",
        // Registro de configuración remota
        "CREATE CONSTRAINT system_config_id IF NOT EXISTS
         FOR (s:SystemConfig)
         REQUIRE s.id IS UNIQUE",
    ];

    for stmt in statements {
        graph.run(query(stmt)).await?;
    }

    info!("Esquema de Neo4j asegurado (constraints básicos creados).");
    Ok(())
}
