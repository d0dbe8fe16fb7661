//! Stage output cache
//!
//! Entries are keyed by `(stage id, fingerprint)`. The fingerprint covers the
//! stage definition (prompt, declared outputs, agent and model), its cache-key
//! inputs and the content of its watched files, so a changed file produces
//! a different key. The previous variant for the same inputs is purged as
//! soon as the change is observed, independent of TTL.
//!
//! At most one computation per key is in flight; concurrent callers wait
//! for it and then read its result from the cache.

use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::types::{OutputMap, PipelineStage, StageOutput};
use crate::{Error, Result};

/// Marker hashed in place of a watched file that does not exist
const ABSENT_FILE: &str = "absent";

type CacheKey = (String, String);

/// Cache identity of one stage invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// Hash of stage definition, key inputs and watched file contents
    pub key: String,
    /// Hash of stage definition and key inputs only
    pub input_digest: String,
}

impl Fingerprint {
    /// Compute the fingerprint; relative file paths resolve against `base_dir`
    pub async fn compute(stage: &PipelineStage, inputs: &OutputMap, base_dir: &Path) -> Result<Self> {
        let config = stage.cache.as_ref();

        // Stages from different pipelines may share an id
        let mut input_hasher = Sha256::new();
        for part in [&stage.stage, &stage.prompt] {
            input_hasher.update(part.as_bytes());
            input_hasher.update([0]);
        }
        for output in &stage.outputs {
            input_hasher.update(output.as_bytes());
            input_hasher.update([0]);
        }
        for part in [&stage.agent, &stage.model] {
            input_hasher.update([1]);
            input_hasher.update(part.as_deref().unwrap_or_default().as_bytes());
        }
        input_hasher.update([0]);

        let key_inputs: Vec<(&str, &Value)> = match config.and_then(|c| c.cache_key_inputs.as_ref())
        {
            Some(names) => {
                let mut names: Vec<&str> = names.iter().map(String::as_str).collect();
                names.sort_unstable();
                names.dedup();
                names
                    .into_iter()
                    .map(|n| (n, inputs.get(n).unwrap_or(&Value::Null)))
                    .collect()
            }
            None => {
                let mut all: Vec<(&str, &Value)> =
                    inputs.iter().map(|(k, v)| (k.as_str(), v)).collect();
                all.sort_unstable_by(|a, b| a.0.cmp(b.0));
                all
            }
        };

        for (name, value) in key_inputs {
            input_hasher.update(name.as_bytes());
            input_hasher.update([0]);
            input_hasher.update(canonical_json(value).as_bytes());
            input_hasher.update([0]);
        }
        let input_digest = hex::encode(input_hasher.finalize());

        let mut hasher = Sha256::new();
        hasher.update(input_digest.as_bytes());

        let mut files: Vec<&str> = config
            .map(|c| c.file_dependencies.iter().map(String::as_str).collect())
            .unwrap_or_default();
        files.sort_unstable();
        files.dedup();

        for file in files {
            let file_hash = hash_file(&base_dir.join(file)).await?;
            hasher.update(file.as_bytes());
            hasher.update([0]);
            hasher.update(file_hash.as_bytes());
            hasher.update([0]);
        }

        Ok(Self {
            key: hex::encode(hasher.finalize()),
            input_digest,
        })
    }

    /// Short form for logs
    pub fn short(&self) -> &str {
        &self.key[..self.key.len().min(12)]
    }
}

async fn hash_file(path: &Path) -> Result<String> {
    match tokio::fs::read(path).await {
        Ok(content) => Ok(hex::encode(Sha256::digest(&content))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ABSENT_FILE.to_string()),
        Err(e) => Err(Error::Io(e)),
    }
}

/// JSON text with object keys sorted at every level
fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    output: StageOutput,
    input_digest: String,
    created_at: Instant,
    expires_at: Instant,
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Shared stage output cache, safe to use from concurrent runs
#[derive(Debug)]
pub struct StageCache {
    entries: DashMap<CacheKey, CacheEntry>,
    /// (stage id, input digest) -> fingerprint key of the live variant
    latest: DashMap<CacheKey, String>,
    in_flight: DashMap<CacheKey, Arc<Mutex<()>>>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for StageCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl StageCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            latest: DashMap::new(),
            in_flight: DashMap::new(),
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Live entry for the fingerprint, if any
    pub fn get(&self, stage: &str, fingerprint: &Fingerprint) -> Option<StageOutput> {
        self.purge_stale_variant(stage, fingerprint);

        let key = (stage.to_string(), fingerprint.key.clone());
        let expired = match self.entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Some(entry.output.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            trace!(stage, fingerprint = fingerprint.short(), "Cache entry expired");
            self.remove_entry(&key);
        }
        None
    }

    /// Store a successful output
    pub fn insert(&self, stage: &str, fingerprint: &Fingerprint, output: StageOutput, ttl: Duration) {
        let key = (stage.to_string(), fingerprint.key.clone());
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.evict();
        }

        let now = Instant::now();
        self.entries.insert(
            key,
            CacheEntry {
                output,
                input_digest: fingerprint.input_digest.clone(),
                created_at: now,
                expires_at: now + ttl,
            },
        );

        let variant = (stage.to_string(), fingerprint.input_digest.clone());
        if let Some(previous) = self.latest.insert(variant, fingerprint.key.clone()) {
            if previous != fingerprint.key {
                self.entries.remove(&(stage.to_string(), previous));
            }
        }
    }

    /// Return the cached output, or run `compute` once and cache its
    /// successful result. The flag is true for a cache hit.
    ///
    /// Errors and unsuccessful outputs are never cached.
    pub async fn get_or_compute<F, Fut>(
        &self,
        stage: &str,
        fingerprint: &Fingerprint,
        ttl: Duration,
        compute: F,
    ) -> Result<(StageOutput, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StageOutput>>,
    {
        if let Some(output) = self.get(stage, fingerprint) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok((output, true));
        }

        let key = (stage.to_string(), fingerprint.key.clone());
        let lock = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;

            // Another caller may have filled the entry while we waited
            if let Some(output) = self.get(stage, fingerprint) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok((output, true))
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                match compute().await {
                    Ok(output) => {
                        if output.success {
                            self.insert(stage, fingerprint, output.clone(), ttl);
                            debug!(
                                stage,
                                fingerprint = fingerprint.short(),
                                ttl_ms = ttl.as_millis() as u64,
                                "Cached stage output"
                            );
                        }
                        Ok((output, false))
                    }
                    Err(e) => Err(e),
                }
            }
        };

        // One reference is held by the map and one by us
        self.in_flight
            .remove_if(&key, |_, l| Arc::strong_count(l) <= 2);

        result
    }

    /// Drop every entry of a stage
    pub fn invalidate_stage(&self, stage: &str) {
        self.entries.retain(|(s, _), _| s != stage);
        self.latest.retain(|(s, _), _| s != stage);
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.latest.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    fn purge_stale_variant(&self, stage: &str, fingerprint: &Fingerprint) {
        let variant = (stage.to_string(), fingerprint.input_digest.clone());
        let stale = self
            .latest
            .get(&variant)
            .map(|live| live.value().clone())
            .filter(|live| live != &fingerprint.key);

        if let Some(stale) = stale {
            debug!(stage, "Watched files changed; invalidating cached output");
            self.entries.remove(&(stage.to_string(), stale));
            self.latest.remove(&variant);
        }
    }

    /// Remove an entry along with its variant record, unless a newer
    /// variant has taken that record over
    fn remove_entry(&self, key: &CacheKey) {
        if let Some(((stage, fingerprint), entry)) = self.entries.remove(key) {
            self.latest
                .remove_if(&(stage, entry.input_digest), |_, live| live == &fingerprint);
        }
    }

    /// Drop expired entries, then the oldest one if still full
    fn evict(&self) {
        let now = Instant::now();
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|e| e.value().expires_at <= now)
            .map(|e| e.key().clone())
            .collect();
        for key in &expired {
            self.remove_entry(key);
        }

        if self.entries.len() >= self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().created_at)
                .map(|e| e.key().clone());
            if let Some(key) = oldest {
                self.remove_entry(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::StageCacheConfig;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn inputs(value: Value) -> OutputMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn output(stage: &str, text: &str) -> StageOutput {
        StageOutput::success(stage, inputs(json!({ "text": text })), 1)
    }

    fn stage(id: &str) -> PipelineStage {
        PipelineStage::new(id, "Summarize {{text}}")
    }

    fn cached(id: &str, config: StageCacheConfig) -> PipelineStage {
        stage(id).with_cache(config)
    }

    #[tokio::test]
    async fn test_fingerprint_stable_and_key_order_independent() {
        let dir = TempDir::new().unwrap();
        let a = Fingerprint::compute(
            &stage("plan"),
            &inputs(json!({"x": 1, "y": {"b": 2, "a": 1}})),
            dir.path(),
        )
        .await
        .unwrap();

        let mut reordered = OutputMap::new();
        reordered.insert("y".into(), json!({"a": 1, "b": 2}));
        reordered.insert("x".into(), json!(1));
        let b = Fingerprint::compute(&stage("plan"), &reordered, dir.path())
            .await
            .unwrap();

        assert_eq!(a, b);

        let other_stage = Fingerprint::compute(&stage("build"), &reordered, dir.path())
            .await
            .unwrap();
        assert_ne!(a.key, other_stage.key);
    }

    #[tokio::test]
    async fn test_fingerprint_covers_stage_definition() {
        let dir = TempDir::new().unwrap();
        let text = inputs(json!({"text": "hello"}));
        let base = Fingerprint::compute(&stage("summarize"), &text, dir.path())
            .await
            .unwrap();

        let variants = [
            PipelineStage::new("summarize", "Translate {{text}} to French"),
            stage("summarize").with_outputs(&["summary"]),
            stage("summarize").with_agent("technical-writer"),
            stage("summarize").with_model("fast-model"),
        ];
        for variant in &variants {
            let fp = Fingerprint::compute(variant, &text, dir.path()).await.unwrap();
            assert_ne!(fp.key, base.key);
            assert_ne!(fp.input_digest, base.input_digest);
        }

        // A timeout does not change what the stage produces
        let same = stage("summarize").with_timeout_ms(5_000);
        let fp = Fingerprint::compute(&same, &text, dir.path()).await.unwrap();
        assert_eq!(fp, base);
    }

    #[tokio::test]
    async fn test_fingerprint_key_inputs_subset() {
        let dir = TempDir::new().unwrap();
        let config = StageCacheConfig::default().with_key_inputs(&["topic"]);

        let a = Fingerprint::compute(
            &cached("s", config.clone()),
            &inputs(json!({"topic": "rust", "noise": 1})),
            dir.path(),
        )
        .await
        .unwrap();
        let b = Fingerprint::compute(
            &cached("s", config),
            &inputs(json!({"topic": "rust", "noise": 2})),
            dir.path(),
        )
        .await
        .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_file_change_invalidates_before_ttl() {
        let dir = TempDir::new().unwrap();
        let watched = dir.path().join("schema.sql");
        std::fs::write(&watched, "create table a (id int);").unwrap();

        let stage = cached(
            "s",
            StageCacheConfig::default().with_file_dependencies(&["schema.sql"]),
        );
        let cache = StageCache::new(16);
        let stage_inputs = inputs(json!({"q": "x"}));

        let fp1 = Fingerprint::compute(&stage, &stage_inputs, dir.path())
            .await
            .unwrap();
        cache.insert("s", &fp1, output("s", "v1"), Duration::from_secs(3600));
        assert!(cache.get("s", &fp1).is_some());

        std::fs::write(&watched, "create table a (id bigint);").unwrap();
        let fp2 = Fingerprint::compute(&stage, &stage_inputs, dir.path())
            .await
            .unwrap();
        assert_ne!(fp1.key, fp2.key);
        assert_eq!(fp1.input_digest, fp2.input_digest);

        assert!(cache.get("s", &fp2).is_none());
        // the old variant is gone too, even though its TTL has not elapsed
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_missing_watched_file_is_hashed_as_absent() {
        let dir = TempDir::new().unwrap();
        let stage = cached(
            "s",
            StageCacheConfig::default().with_file_dependencies(&["later.txt"]),
        );
        let empty = OutputMap::new();

        let before = Fingerprint::compute(&stage, &empty, dir.path())
            .await
            .unwrap();
        std::fs::write(dir.path().join("later.txt"), "now here").unwrap();
        let after = Fingerprint::compute(&stage, &empty, dir.path())
            .await
            .unwrap();
        assert_ne!(before.key, after.key);
    }

    #[tokio::test]
    async fn test_expired_entry_not_returned() {
        let dir = TempDir::new().unwrap();
        let cache = StageCache::new(16);
        let fp = Fingerprint::compute(&stage("s"), &OutputMap::new(), dir.path())
            .await
            .unwrap();

        cache.insert("s", &fp, output("s", "v"), Duration::from_millis(0));
        assert!(cache.get("s", &fp).is_none());
        assert!(cache.is_empty());
        assert!(cache.latest.is_empty());
    }

    #[tokio::test]
    async fn test_get_or_compute_single_flight() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(StageCache::new(16));
        let calls = Arc::new(AtomicUsize::new(0));
        let fp = Fingerprint::compute(&stage("s"), &OutputMap::new(), dir.path())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            let fp = fp.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("s", &fp, Duration::from_secs(60), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(output("s", "computed"))
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut hits = 0;
        for handle in handles {
            let (out, hit) = handle.await.unwrap();
            assert_eq!(out.outputs["text"], json!("computed"));
            if hit {
                hits += 1;
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hits, 7);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_failures_and_errors_not_cached() {
        let dir = TempDir::new().unwrap();
        let cache = StageCache::new(16);
        let fp = Fingerprint::compute(&stage("s"), &OutputMap::new(), dir.path())
            .await
            .unwrap();

        let (out, hit) = cache
            .get_or_compute("s", &fp, Duration::from_secs(60), || async {
                Ok(StageOutput::failure("s", "boom", 1))
            })
            .await
            .unwrap();
        assert!(!out.success);
        assert!(!hit);
        assert!(cache.is_empty());

        let err = cache
            .get_or_compute("s", &fp, Duration::from_secs(60), || async {
                Err(Error::Cancelled)
            })
            .await;
        assert!(matches!(err, Err(Error::Cancelled)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_eviction_bounds_entries() {
        let dir = TempDir::new().unwrap();
        let cache = StageCache::new(2);
        for i in 0..5 {
            let fp = Fingerprint::compute(&stage("s"), &inputs(json!({ "i": i })), dir.path())
                .await
                .unwrap();
            cache.insert("s", &fp, output("s", "v"), Duration::from_secs(60));
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.latest.len(), 2);

        // Expired entries release their variant records on eviction as well
        let cache = StageCache::new(2);
        for i in 0..5 {
            let fp = Fingerprint::compute(&stage("s"), &inputs(json!({ "i": i })), dir.path())
                .await
                .unwrap();
            cache.insert("s", &fp, output("s", "v"), Duration::ZERO);
        }
        assert!(cache.len() <= 2);
        assert!(cache.latest.len() <= 2);

        cache.invalidate_stage("s");
        assert!(cache.is_empty());
        assert!(cache.latest.is_empty());
    }
}
