use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::types::{AnalysisRequest, ImageSource, ProjectImage, ProjectSpec};

/// Cache backend abstraction. The in-memory store below is the default;
/// deployments can plug in a shared store behind the same trait.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<ProjectSpec>;
    async fn set(&self, key: &str, value: ProjectSpec, ttl: Duration);
}

struct CacheEntry {
    value: ProjectSpec,
    expires_at: Instant,
}

/// Process-local cache with TTL expiry. Expired entries are purged lazily
/// on read. Safe for concurrent pipeline runs.
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Called opportunistically by `set`.
    fn purge_expired(entries: &mut HashMap<String, CacheEntry>) {
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Option<ProjectSpec> {
        let mut entries = self.entries.lock().expect("cache poisoned");
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: ProjectSpec, ttl: Duration) {
        let mut entries = self.entries.lock().expect("cache poisoned");
        Self::purge_expired(&mut entries);
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

/// Stable identity for an image, independent of its byte content for
/// path/url sources. Inline bytes are identified by content hash so the
/// same upload always keys the same.
pub fn image_identity(image: &ProjectImage) -> String {
    match &image.source {
        ImageSource::Path(p) => format!("{}:path:{}", image.id, p.display()),
        ImageSource::Url(u) => format!("{}:url:{u}", image.id),
        ImageSource::Bytes(b) => {
            let digest = Sha256::digest(b);
            format!("{}:bytes:{}", image.id, hex_prefix(&digest, 16))
        }
    }
}

/// Deterministic cache key over image identities, a bounded notes prefix,
/// and the job zip code.
pub fn cache_key(request: &AnalysisRequest, notes_prefix_len: usize) -> String {
    let mut hasher = Sha256::new();
    for image in &request.images {
        hasher.update(image_identity(image).as_bytes());
        hasher.update([0u8]);
    }
    let prefix: String = request.notes.chars().take(notes_prefix_len).collect();
    hasher.update(prefix.as_bytes());
    hasher.update([0u8]);
    hasher.update(request.location.zip.as_bytes());

    let digest = hasher.finalize();
    hex_prefix(&digest, digest.len())
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes
        .iter()
        .take(len)
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{
        AnalysisOptions, ImageKind, ProcessingMeta, ProjectLocation,
    };

    fn sample_spec() -> ProjectSpec {
        ProjectSpec {
            project_type: "fencing".into(),
            project_subtype: None,
            dimensions: HashMap::new(),
            options: HashMap::new(),
            detected_elements: vec![],
            material_availability: None,
            recommended_products: vec![],
            purchase_order_draft: None,
            generated_with_fallback: false,
            meta: ProcessingMeta::default(),
        }
    }

    fn sample_request(notes: &str, zip: &str) -> AnalysisRequest {
        AnalysisRequest {
            images: vec![ProjectImage {
                id: "img-1".into(),
                source: ImageSource::Url("https://example.com/fence.jpg".into()),
                kind: ImageKind::Site,
                mime_type: "image/jpeg".into(),
            }],
            notes: notes.into(),
            location: ProjectLocation {
                zip: zip.into(),
                ..Default::default()
            },
            options: AnalysisOptions::default(),
        }
    }

    #[tokio::test]
    async fn get_returns_stored_value_within_ttl() {
        let store = MemoryCacheStore::new();
        store
            .set("k", sample_spec(), Duration::from_secs(60))
            .await;

        let hit = store.get("k").await.unwrap();
        assert_eq!(hit.project_type, "fencing");
    }

    #[tokio::test]
    async fn expired_entries_are_dropped_on_read() {
        let store = MemoryCacheStore::new();
        store.set("k", sample_spec(), Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(store.get("k").await.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn set_purges_other_expired_entries() {
        let store = MemoryCacheStore::new();
        store
            .set("old", sample_spec(), Duration::from_millis(1))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        store
            .set("new", sample_spec(), Duration::from_secs(60))
            .await;

        assert_eq!(store.len(), 1);
    }

    #[test]
    fn cache_key_is_deterministic() {
        let a = cache_key(&sample_request("build a fence", "94509"), 200);
        let b = cache_key(&sample_request("build a fence", "94509"), 200);
        assert_eq!(a, b);
    }

    #[test]
    fn cache_key_varies_with_zip() {
        let a = cache_key(&sample_request("build a fence", "94509"), 200);
        let b = cache_key(&sample_request("build a fence", "94510"), 200);
        assert_ne!(a, b);
    }

    #[test]
    fn cache_key_ignores_notes_past_prefix() {
        let filler = "x".repeat(200);
        let a = cache_key(&sample_request(&format!("{filler} tail one"), "94509"), 200);
        let b = cache_key(&sample_request(&format!("{filler} tail two"), "94509"), 200);
        assert_eq!(a, b);
    }

    #[test]
    fn inline_bytes_identity_uses_content_hash() {
        let img_a = ProjectImage {
            id: "i".into(),
            source: ImageSource::Bytes(vec![1, 2, 3]),
            kind: ImageKind::Site,
            mime_type: "image/png".into(),
        };
        let img_b = ProjectImage {
            id: "i".into(),
            source: ImageSource::Bytes(vec![1, 2, 3]),
            kind: ImageKind::Site,
            mime_type: "image/png".into(),
        };
        let img_c = ProjectImage {
            id: "i".into(),
            source: ImageSource::Bytes(vec![9, 9, 9]),
            kind: ImageKind::Site,
            mime_type: "image/png".into(),
        };
        assert_eq!(image_identity(&img_a), image_identity(&img_b));
        assert_ne!(image_identity(&img_a), image_identity(&img_c));
    }
}
