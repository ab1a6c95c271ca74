use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::CacheConfig;
use crate::image::EcgImage;

/// Pixel bytes sampled for the image hash; a stride keeps hashing cheap on
/// large scans while still covering the whole frame.
const HASH_SAMPLE_TARGET: usize = 64 * 1024;

/// Hex characters kept from each SHA-256 for the file name.
const SHORT_HASH_LEN: usize = 16;

// ── Records ───────────────────────────────────────────────────────────────

/// One persisted oracle response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub hash: String,
    /// Milliseconds since the epoch at store time.
    pub timestamp: u64,
    #[serde(rename = "promptHash")]
    pub prompt_hash: String,
    pub result: serde_json::Value,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Keys ──────────────────────────────────────────────────────────────────

/// Short SHA-256 of a strided pixel sample plus the dimensions. Two images
/// with identical content hash identically regardless of source file.
pub fn image_hash(img: &EcgImage) -> String {
    let raw = img.as_rgba().as_raw();
    let stride = (raw.len() / HASH_SAMPLE_TARGET).max(1);
    let mut hasher = Sha256::new();
    hasher.update(img.width().to_le_bytes());
    hasher.update(img.height().to_le_bytes());
    for byte in raw.iter().step_by(stride) {
        hasher.update([*byte]);
    }
    let digest = hasher.finalize();
    hex_prefix(&digest)
}

pub fn prompt_hash(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    hex_prefix(&digest)
}

fn hex_prefix(digest: &[u8]) -> String {
    let mut out = String::with_capacity(SHORT_HASH_LEN);
    for b in digest {
        if out.len() >= SHORT_HASH_LEN {
            break;
        }
        out.push_str(&format!("{b:02x}"));
    }
    out.truncate(SHORT_HASH_LEN);
    out
}

// ── Cache ─────────────────────────────────────────────────────────────────

/// Disk + in-memory cache of oracle analyses, keyed by
/// `(image hash, prompt hash)`. Entries expire after the configured TTL and
/// the disk footprint is bounded: oldest files are evicted past the cap.
/// Per-key locks give one-writer-many-readers behavior — at most one
/// outstanding oracle call per key.
pub struct OracleCache {
    cfg: CacheConfig,
    mem: Mutex<HashMap<String, CacheRecord>>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl OracleCache {
    pub fn new(cfg: CacheConfig) -> Self {
        OracleCache {
            cfg,
            mem: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// The per-key mutex; hold its guard across lookup + fetch + store so
    /// concurrent digitizations of the same image make one oracle call.
    pub fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.inflight.lock().unwrap();
        map.entry(key.to_string()).or_default().clone()
    }

    fn file_for(&self, key: &str) -> Option<PathBuf> {
        self.cfg.dir.as_ref().map(|d| d.join(format!("{key}.json")))
    }

    fn expired(&self, record: &CacheRecord) -> bool {
        now_ms().saturating_sub(record.timestamp) > self.cfg.ttl_ms
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        if let Some(record) = self.mem.lock().unwrap().get(key) {
            if !self.expired(record) {
                return Some(record.result.clone());
            }
        }

        let path = self.file_for(key)?;
        let text = fs::read_to_string(&path).ok()?;
        let record: CacheRecord = serde_json::from_str(&text).ok()?;
        if self.expired(&record) {
            let _ = fs::remove_file(&path);
            return None;
        }
        let result = record.result.clone();
        self.mem.lock().unwrap().insert(key.to_string(), record);
        Some(result)
    }

    pub fn put(&self, image_hash: &str, prompt_hash: &str, result: serde_json::Value) {
        let key = format!("{image_hash}_{prompt_hash}");
        let record = CacheRecord {
            hash: image_hash.to_string(),
            timestamp: now_ms(),
            prompt_hash: prompt_hash.to_string(),
            result,
        };

        if let Some(path) = self.file_for(&key) {
            if let Some(parent) = path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            match serde_json::to_string(&record) {
                Ok(text) => {
                    if let Err(e) = fs::write(&path, text) {
                        tracing::warn!(error = %e, "cache write failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "cache serialize failed"),
            }
            self.evict_over_budget();
        }
        self.mem.lock().unwrap().insert(key, record);
    }

    /// Drop oldest on-disk entries until total size fits the budget.
    fn evict_over_budget(&self) {
        let Some(dir) = self.cfg.dir.as_ref() else { return };
        let Ok(entries) = fs::read_dir(dir) else { return };

        let mut files: Vec<(PathBuf, u64, SystemTime)> = entries
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                Some((e.path(), meta.len(), meta.modified().ok()?))
            })
            .collect();

        let mut total: u64 = files.iter().map(|&(_, len, _)| len).sum();
        if total <= self.cfg.max_bytes {
            return;
        }
        files.sort_by_key(|&(_, _, mtime)| mtime);
        for (path, len, _) in files {
            if total <= self.cfg.max_bytes {
                break;
            }
            if fs::remove_file(&path).is_ok() {
                total = total.saturating_sub(len);
            }
        }
    }

    /// Explicit wipe of both tiers.
    pub fn clear(&self) {
        self.mem.lock().unwrap().clear();
        if let Some(dir) = self.cfg.dir.as_ref() {
            if let Ok(entries) = fs::read_dir(dir) {
                for entry in entries.flatten() {
                    if entry.path().extension().is_some_and(|x| x == "json") {
                        let _ = fs::remove_file(entry.path());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Color;
    use serde_json::json;

    fn mem_cache(ttl_ms: u64) -> OracleCache {
        OracleCache::new(CacheConfig { enabled: true, dir: None, ttl_ms, max_bytes: 1 << 20 })
    }

    #[test]
    fn image_hash_is_stable_and_content_sensitive() {
        let a = crate::image::solid_image(40, 30, Color::WHITE);
        let b = crate::image::solid_image(40, 30, Color::WHITE);
        let c = crate::image::solid_image(40, 30, Color::BLACK);
        assert_eq!(image_hash(&a), image_hash(&b));
        assert_ne!(image_hash(&a), image_hash(&c));
        assert_eq!(image_hash(&a).len(), SHORT_HASH_LEN);
    }

    #[test]
    fn dimensions_change_the_hash() {
        let a = crate::image::solid_image(40, 30, Color::WHITE);
        let b = crate::image::solid_image(30, 40, Color::WHITE);
        assert_ne!(image_hash(&a), image_hash(&b));
    }

    #[test]
    fn put_then_get_round_trips_in_memory() {
        let cache = mem_cache(60_000);
        cache.put("img0", "prompt0", json!({"panels": []}));
        assert_eq!(cache.get("img0_prompt0"), Some(json!({"panels": []})));
        assert_eq!(cache.get("img0_other"), None);
    }

    #[test]
    fn expired_entries_are_not_served() {
        let cache = mem_cache(0);
        cache.put("img0", "prompt0", json!(1));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(cache.get("img0_prompt0"), None);
    }

    #[test]
    fn clear_empties_the_memory_tier() {
        let cache = mem_cache(60_000);
        cache.put("img0", "prompt0", json!(1));
        cache.clear();
        assert_eq!(cache.get("img0_prompt0"), None);
    }
}
