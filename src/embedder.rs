//! Text -> vector collaborators
//!
//! The model itself is opaque. [`HttpEmbedder`] talks to an embedding
//! service, [`HashEmbedder`] is a deterministic offline stand-in with no
//! semantic meaning, and [`CachedEmbedder`] puts an LRU in front of either.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use postvec_core::simd::l2_normalize;

pub const DEFAULT_MODEL_ID: &str = "all-MiniLM-L6-v2";
pub const DEFAULT_DIMENSIONS: usize = 384;

#[derive(Error, Debug)]
pub enum EmbedError {
    /// Call failed or timed out; the caller skips the document
    #[error("Embedding unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed embedding response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for EmbedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            EmbedError::Malformed(err.to_string())
        } else {
            EmbedError::Unavailable(err.to_string())
        }
    }
}

pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// Identifier of the model producing the vectors
    fn model_id(&self) -> &str;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// `POST {base_url}/embed {"text": ..}` -> `{"embeddings": [[..]]}`
pub struct HttpEmbedder {
    endpoint: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, model_id: &str, timeout: Duration) -> Result<Self, EmbedError> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: format!("{}/embed", base_url.trim_end_matches('/')),
            model_id: model_id.to_string(),
            client,
        })
    }
}

impl Embedder for HttpEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let response: EmbedResponse = self
            .client
            .post(&self.endpoint)
            .json(&EmbedRequest { text })
            .send()?
            .error_for_status()?
            .json()?;

        let vector = response
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::Malformed("no embedding returned".into()))?;
        if vector.is_empty() {
            return Err(EmbedError::Malformed("empty embedding".into()));
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(EmbedError::Malformed("non-finite component".into()));
        }
        Ok(vector)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Deterministic character-hash vectors for offline runs and tests.
///
/// Similar strings land near each other only by accident; this is not a
/// semantic model.
pub struct HashEmbedder {
    dimensions: usize,
    model_id: String,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            model_id: format!("hash-{}", dimensions.max(1)),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut vector = vec![0.0f32; self.dimensions];
        for (i, ch) in text.chars().enumerate() {
            let code = ch as u64;
            let slot = (code.wrapping_mul(i as u64 + 1) % self.dimensions as u64) as usize;
            vector[slot] += code as f32 / 255.0;
        }
        l2_normalize(&mut vector);
        Ok(vector)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// LRU cache keyed by exact text
pub struct CachedEmbedder<E> {
    inner: E,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl<E: Embedder> CachedEmbedder<E> {
    pub fn new(inner: E, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

impl<E: Embedder> Embedder for CachedEmbedder<E> {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        if let Some(hit) = self.cache.lock().get(text) {
            return Ok(hit.clone());
        }
        // Lock is not held across the call; concurrent misses may embed twice
        let vector = self.inner.embed(text)?;
        self.cache.lock().put(text.to_string(), vector.clone());
        Ok(vector)
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}

impl<E: Embedder + ?Sized> Embedder for Box<E> {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        (**self).embed(text)
    }

    fn model_id(&self) -> &str {
        (**self).model_id()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use postvec_core::simd::is_normalized;

    struct Counting {
        calls: AtomicUsize,
    }

    impl Embedder for Counting {
        fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if text.is_empty() {
                return Err(EmbedError::Unavailable("empty".into()));
            }
            Ok(vec![text.len() as f32, 1.0])
        }

        fn model_id(&self) -> &str {
            "counting"
        }
    }

    #[test]
    fn test_hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(32);
        let a = embedder.embed("Morning yoga in the park").unwrap();
        let b = embedder.embed("Morning yoga in the park").unwrap();
        let c = embedder.embed("Lost cat near 1st street").unwrap();

        assert_eq!(a.len(), 32);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(is_normalized(&a, 1e-4));
    }

    #[test]
    fn test_hash_embedder_empty_text_is_zero_vector() {
        let v = HashEmbedder::new(8).embed("").unwrap();
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_cache_hits_skip_inner_and_errors_are_not_cached() {
        let cached = CachedEmbedder::new(
            Counting {
                calls: AtomicUsize::new(0),
            },
            2,
        );

        cached.embed("alpha").unwrap();
        cached.embed("alpha").unwrap();
        assert_eq!(cached.inner().calls.load(Ordering::SeqCst), 1);

        assert!(cached.embed("").is_err());
        assert!(cached.embed("").is_err());
        assert_eq!(cached.inner().calls.load(Ordering::SeqCst), 3);
        assert_eq!(cached.cached(), 1);
    }

    #[test]
    fn test_cache_evicts_least_recent() {
        let cached = CachedEmbedder::new(
            Counting {
                calls: AtomicUsize::new(0),
            },
            2,
        );
        cached.embed("a").unwrap();
        cached.embed("b").unwrap();
        cached.embed("a").unwrap();
        cached.embed("c").unwrap(); // evicts "b"
        cached.embed("b").unwrap();
        assert_eq!(cached.inner().calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_http_embedder_unreachable_is_unavailable() {
        let embedder = HttpEmbedder::new("http://127.0.0.1:9", "m", Duration::from_millis(200)).unwrap();
        assert!(matches!(embedder.embed("hi"), Err(EmbedError::Unavailable(_))));
    }
}
