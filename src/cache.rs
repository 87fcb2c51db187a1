//! Caché volátil en proceso con TTL y reloj inyectado.
//!
//! Es la capa rápida de las dos capas de caché: absorbe las lecturas
//! repetidas de los dashboards. La capa durable es el propio registro en
//! Neo4j, que se consulta cuando aquí no hay entrada vigente (y es la
//! fuente de verdad tras un reinicio del proceso).

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Fuente de tiempo inyectable; los tests usan un reloj falso para
/// verificar la expiración sin depender del tiempo real.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Reloj del sistema (producción).
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

struct CacheEntry {
    value: Value,
    written_at: DateTime<Utc>,
    ttl_secs: u64,
}

/// Servicio de caché con `get/set/invalidate` y expiración por TTL.
#[derive(Clone)]
pub struct CacheService {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    clock: Arc<dyn Clock>,
}

impl CacheService {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Devuelve el valor si existe y su TTL no ha vencido.
    pub fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(key)?;
        let age = self.clock.now() - entry.written_at;
        if age >= Duration::seconds(entry.ttl_secs as i64) {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn set(&self, key: &str, value: Value, ttl_secs: u64) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                written_at: self.clock.now(),
                ttl_secs,
            },
        );
    }

    /// Invalidación explícita: se llama al disparar una extracción fresca
    /// para el emisor afectado.
    pub fn invalidate(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Reloj falso que avanza manualmente.
    struct FakeClock {
        seconds: AtomicI64,
    }

    impl FakeClock {
        fn new() -> Self {
            Self {
                seconds: AtomicI64::new(0),
            }
        }

        fn advance(&self, secs: i64) {
            self.seconds.fetch_add(secs, Ordering::SeqCst);
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            DateTime::from_timestamp(self.seconds.load(Ordering::SeqCst), 0).unwrap()
        }
    }

    #[test]
    fn entrada_vigente_se_devuelve() {
        let clock = Arc::new(FakeClock::new());
        let cache = CacheService::new(clock.clone());

        cache.set("metrics_banpro", json!({"roe": 15.2}), 120);
        clock.advance(119);
        assert_eq!(cache.get("metrics_banpro"), Some(json!({"roe": 15.2})));
    }

    #[test]
    fn entrada_expirada_no_se_devuelve() {
        let clock = Arc::new(FakeClock::new());
        let cache = CacheService::new(clock.clone());

        cache.set("metrics_banpro", json!({"roe": 15.2}), 120);
        clock.advance(120);
        assert_eq!(cache.get("metrics_banpro"), None);
    }

    #[test]
    fn invalidar_elimina_la_entrada() {
        let clock = Arc::new(FakeClock::new());
        let cache = CacheService::new(clock);

        cache.set("history_bdf", json!([1, 2, 3]), 300);
        cache.invalidate("history_bdf");
        assert_eq!(cache.get("history_bdf"), None);
    }

    #[test]
    fn reescribir_reinicia_el_ttl() {
        let clock = Arc::new(FakeClock::new());
        let cache = CacheService::new(clock.clone());

        cache.set("k", json!(1), 100);
        clock.advance(90);
        cache.set("k", json!(2), 100);
        clock.advance(90);
        assert_eq!(cache.get("k"), Some(json!(2)));
    }
}
