//! Path-keyed response cache with per-endpoint TTLs
//!
//! Two layers: an in-memory map consulted on every request, and an optional
//! SQLite-backed layer that persists entries across runs. Locking is
//! per-key: each path has its own cell, so traffic on different paths
//! never contends. No HTTP is ever issued while a cache lock is held.

use crate::Result;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default TTL for paths not matched by [`ttl_for_path`].
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// TTL for cluster-level endpoints.
pub const CLUSTER_TTL: Duration = Duration::from_secs(10);

/// TTL for per-node status.
pub const NODE_TTL: Duration = Duration::from_secs(10);

/// TTL for guest status and agent queries.
pub const GUEST_TTL: Duration = Duration::from_secs(5);

/// TTL for guest config, which changes rarely.
pub const CONFIG_TTL: Duration = Duration::from_secs(60);

/// Resolve the TTL for a request path (query string included in the key,
/// ignored for TTL matching).
pub fn ttl_for_path(path: &str) -> Duration {
    let path = path.split('?').next().unwrap_or(path);
    if path == "/cluster/status" || path == "/cluster/resources" {
        return CLUSTER_TTL;
    }
    let segs: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    match segs.as_slice() {
        ["nodes", _, "status"] => NODE_TTL,
        ["nodes", _, "qemu" | "lxc", _, "status", "current"] => GUEST_TTL,
        ["nodes", _, "qemu" | "lxc", _, "config"] => CONFIG_TTL,
        ["nodes", _, "qemu", _, "agent", ..] => GUEST_TTL,
        _ => DEFAULT_TTL,
    }
}

struct Entry {
    payload: String,
    stored_at: i64,
}

/// One lock per path. Readers and writers on different paths never block
/// one another; the outer map lock is held only long enough to hand out
/// the cell, never across payload work.
type Cell = Arc<RwLock<Option<Entry>>>;

/// Two-layer response cache keyed by request path
pub struct ResponseCache {
    cells: RwLock<HashMap<String, Cell>>,
    disk: Option<DiskCache>,
}

impl ResponseCache {
    /// In-memory only.
    pub fn new() -> Self {
        ResponseCache {
            cells: RwLock::new(HashMap::new()),
            disk: None,
        }
    }

    /// With a persistent layer at `<dir>/cache.db`.
    pub fn with_disk(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let disk = DiskCache::open(&dir.join("cache.db"))?;
        Ok(ResponseCache {
            cells: RwLock::new(HashMap::new()),
            disk: Some(disk),
        })
    }

    fn cell(&self, path: &str) -> Cell {
        if let Some(cell) = self.cells.read().get(path) {
            return Arc::clone(cell);
        }
        let mut cells = self.cells.write();
        Arc::clone(cells.entry(path.to_string()).or_default())
    }

    /// Return the cached value for `path` if it is younger than `ttl`.
    /// Misses fall through to the disk layer, warming the memory layer.
    /// Concurrent reads on the same path serialise only around the
    /// timestamp check.
    pub fn lookup(&self, path: &str, ttl: Duration) -> Option<serde_json::Value> {
        let now = now_unix();
        let cutoff = now - ttl.as_secs() as i64;
        let cell = self.cell(path);

        {
            let guard = cell.read();
            if let Some(entry) = guard.as_ref() {
                if entry.stored_at > cutoff {
                    return serde_json::from_str(&entry.payload).ok();
                }
                return None;
            }
        }

        let disk = self.disk.as_ref()?;
        let (payload, stored_at) = disk.lookup(path)?;
        if stored_at <= cutoff {
            return None;
        }
        let value = serde_json::from_str(&payload).ok()?;
        *cell.write() = Some(Entry { payload, stored_at });
        Some(value)
    }

    /// Store a payload for `path`. Last writer wins.
    pub fn store(&self, path: &str, payload: &serde_json::Value) {
        let raw = payload.to_string();
        let stored_at = now_unix();
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.store(path, &raw, stored_at) {
                debug!("disk cache write failed for {}: {}", path, e);
            }
        }
        *self.cell(path).write() = Some(Entry {
            payload: raw,
            stored_at,
        });
    }

    /// Drop every entry, both layers.
    pub fn clear(&self) {
        self.cells.write().clear();
        if let Some(disk) = &self.disk {
            let _ = disk.clear();
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// SQLite persistence for cache entries
struct DiskCache {
    conn: Mutex<Connection>,
}

impl DiskCache {
    fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS responses (
                path TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                stored_at INTEGER NOT NULL
            );
            "#,
        )?;
        info!("Opened response cache at {:?}", path);
        Ok(DiskCache {
            conn: Mutex::new(conn),
        })
    }

    fn lookup(&self, path: &str) -> Option<(String, i64)> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT payload, stored_at FROM responses WHERE path = ?1",
            params![path],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .ok()
        .flatten()
    }

    fn store(&self, path: &str, payload: &str, stored_at: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO responses (path, payload, stored_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(path) DO UPDATE SET payload = ?2, stored_at = ?3",
            params![path, payload, stored_at],
        )?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM responses", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ttl_table_matches_endpoints() {
        assert_eq!(ttl_for_path("/cluster/status"), CLUSTER_TTL);
        assert_eq!(ttl_for_path("/cluster/resources"), CLUSTER_TTL);
        assert_eq!(ttl_for_path("/nodes/pve1/status"), NODE_TTL);
        assert_eq!(
            ttl_for_path("/nodes/pve1/qemu/100/status/current"),
            GUEST_TTL
        );
        assert_eq!(
            ttl_for_path("/nodes/pve1/lxc/101/status/current"),
            GUEST_TTL
        );
        assert_eq!(ttl_for_path("/nodes/pve1/qemu/100/config"), CONFIG_TTL);
        assert_eq!(
            ttl_for_path("/nodes/pve1/qemu/100/agent/network-get-interfaces"),
            GUEST_TTL
        );
        assert_eq!(ttl_for_path("/nodes/pve1/qemu/100/agent/get-fsinfo"), GUEST_TTL);
    }

    #[test]
    fn fresh_entries_hit_and_stale_miss() {
        let cache = ResponseCache::new();
        let payload = json!({"data": {"cpu": 0.5}});
        cache.store("/nodes/a/status", &payload);
        assert_eq!(
            cache.lookup("/nodes/a/status", Duration::from_secs(10)),
            Some(payload.clone())
        );
        // Zero TTL means everything is stale.
        assert_eq!(cache.lookup("/nodes/a/status", Duration::ZERO), None);
        assert_eq!(cache.lookup("/nodes/b/status", Duration::from_secs(10)), None);
    }

    #[test]
    fn last_writer_wins() {
        let cache = ResponseCache::new();
        cache.store("/k", &json!(1));
        cache.store("/k", &json!(2));
        assert_eq!(cache.lookup("/k", Duration::from_secs(60)), Some(json!(2)));
    }

    #[test]
    fn disk_layer_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let payload = json!({"data": []});
        {
            let cache = ResponseCache::with_disk(dir.path()).unwrap();
            cache.store("/cluster/status", &payload);
        }
        let cache = ResponseCache::with_disk(dir.path()).unwrap();
        assert_eq!(
            cache.lookup("/cluster/status", Duration::from_secs(60)),
            Some(payload)
        );
    }
}
