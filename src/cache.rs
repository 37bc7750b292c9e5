//! Streaming-response cache keyed by normalized prompt
//!
//! What this module provides
//! - `StreamingCache`: deduplicates and replays token streams so repeated
//!   identical prompts collapse into one generation
//!
//! Exports
//! - Models
//!   - `CacheConfig { ttl, max_entries }`
//! - Utils
//!   - `cache_key(prompt)`: SHA-256 of the trimmed prompt text
//!
//! Implementation strategy
//! - The map holds either a finished chunk sequence or a per-key in-flight
//!   marker. A miss installs the marker, then forwards the live stream to the
//!   caller while buffering; the `Done` chunk publishes the buffer
//! - A concurrent miss on the same key awaits the first caller instead of
//!   invoking the generator again; if the producer dies or its consumer drops
//!   the stream early, the marker is removed and one waiter is promoted to
//!   producer
//! - A stream that ends without the `Done` marker is incomplete and is not
//!   cached
//!
//! Testing strategy
//! - Counter-carrying mock generators asserting at-most-once invocation,
//!   sequential and concurrent
//! - TTL expiry, size-bound eviction, and early-drop cleanup

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::error::InferenceError;
use crate::items::StreamChunk;

/// Boxed chunk stream returned by providers and by the cache.
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheConfig {
    /// Entries older than this are regenerated.
    pub ttl: Duration,
    /// Oldest-first eviction kicks in past this many finished entries.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            max_entries: 256,
        }
    }
}

/// Stable key for a prompt: SHA-256 hex of the trimmed text.
pub fn cache_key(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.trim().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

struct CacheEntry {
    chunks: Vec<StreamChunk>,
    created_at: Instant,
}

enum Slot {
    /// Generation in flight; subscribe and re-check when woken.
    Pending(watch::Receiver<bool>),
    Ready(Arc<CacheEntry>),
}

type SlotMap = Arc<Mutex<HashMap<String, Slot>>>;

/// Removes the in-flight marker on every exit path; publishing an entry
/// first converts the removal into an insert. The watch sender drops with
/// the guard, waking waiters after the map is consistent.
struct PendingGuard {
    map: SlotMap,
    key: String,
    entry: Option<CacheEntry>,
    _done: watch::Sender<bool>,
}

impl PendingGuard {
    fn publish(&mut self, chunks: Vec<StreamChunk>) {
        self.entry = Some(CacheEntry {
            chunks,
            created_at: Instant::now(),
        });
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.map.lock() {
            match self.entry.take() {
                Some(entry) => {
                    map.insert(self.key.clone(), Slot::Ready(Arc::new(entry)));
                }
                None => {
                    map.remove(&self.key);
                }
            }
        }
    }
}

/// Deduplicating, replaying cache over token streams.
pub struct StreamingCache {
    map: SlotMap,
    cfg: CacheConfig,
}

impl StreamingCache {
    pub fn new(cfg: CacheConfig) -> Self {
        Self {
            map: Arc::new(Mutex::new(HashMap::new())),
            cfg,
        }
    }

    /// Return a chunk stream for `prompt`, invoking `generate` only when no
    /// fresh entry exists and no other caller is already generating one.
    ///
    /// Repeated calls with an identical prompt replay a content-identical
    /// chunk sequence.
    pub async fn get_or_stream<F, Fut>(
        &self,
        prompt: &str,
        generate: F,
    ) -> Result<ChunkStream, InferenceError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<ChunkStream, InferenceError>> + Send,
    {
        let key = cache_key(prompt);
        let mut generate = Some(generate);

        loop {
            enum Action {
                Replay(Arc<CacheEntry>),
                Wait(watch::Receiver<bool>),
                Produce(PendingGuard),
            }

            let action = {
                let mut map = self.map.lock().expect("cache lock");
                match map.get(&key) {
                    Some(Slot::Ready(entry)) if entry.created_at.elapsed() < self.cfg.ttl => {
                        Action::Replay(entry.clone())
                    }
                    Some(Slot::Pending(rx)) => Action::Wait(rx.clone()),
                    // Vacant, or a stale entry being replaced.
                    _ => {
                        Self::evict_locked(&mut map, self.cfg.max_entries);
                        let (tx, rx) = watch::channel(false);
                        map.insert(key.clone(), Slot::Pending(rx));
                        Action::Produce(PendingGuard {
                            map: self.map.clone(),
                            key: key.clone(),
                            entry: None,
                            _done: tx,
                        })
                    }
                }
            };

            match action {
                Action::Replay(entry) => {
                    debug!(key = %key, chunks = entry.chunks.len(), "cache hit, replaying");
                    return Ok(Box::pin(futures::stream::iter(entry.chunks.clone())));
                }
                Action::Wait(mut rx) => {
                    // Either the value changes or the producer's sender drops;
                    // both mean the map is worth another look.
                    let _ = rx.changed().await;
                }
                Action::Produce(guard) => {
                    debug!(key = %key, "cache miss, streaming and caching");
                    let gen = generate.take().expect("generator consumed once");
                    // On error the guard drops here, clearing the marker and
                    // waking waiters so one of them takes over.
                    let source = gen().await?;
                    return Ok(Self::forward_and_buffer(source, guard));
                }
            }
        }
    }

    /// Number of finished entries currently held.
    pub fn len(&self) -> usize {
        let map = self.map.lock().expect("cache lock");
        map.values()
            .filter(|s| matches!(s, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_locked(map: &mut HashMap<String, Slot>, max_entries: usize) {
        while map.values().filter(|s| matches!(s, Slot::Ready(_))).count() >= max_entries {
            let oldest = map
                .iter()
                .filter_map(|(k, s)| match s {
                    Slot::Ready(e) => Some((k.clone(), e.created_at)),
                    Slot::Pending(_) => None,
                })
                .min_by_key(|(_, at)| *at);
            match oldest {
                Some((k, _)) => {
                    map.remove(&k);
                }
                None => break,
            }
        }
    }

    /// Drive `source` from a task: every chunk is forwarded to the returned
    /// stream and buffered; the `Done` marker publishes the buffer. A
    /// consumer that drops the stream early aborts generation, and the guard
    /// clears the in-flight marker.
    fn forward_and_buffer(mut source: ChunkStream, mut guard: PendingGuard) -> ChunkStream {
        let (tx, rx) = mpsc::channel::<StreamChunk>(32);
        tokio::spawn(async move {
            let mut chunks: Vec<StreamChunk> = Vec::new();
            while let Some(chunk) = source.next().await {
                let done = chunk.is_done();
                chunks.push(chunk.clone());
                if tx.send(chunk).await.is_err() {
                    // Consumer went away; stop consuming the live stream.
                    return;
                }
                if done {
                    guard.publish(chunks);
                    return;
                }
            }
            // Source ended without the completion marker: incomplete, the
            // guard drops without publishing.
        });
        Box::pin(ReceiverStream::new(rx))
    }
}

impl Default for StreamingCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scripted(chunks: Vec<StreamChunk>) -> ChunkStream {
        Box::pin(futures::stream::iter(chunks))
    }

    fn hello_chunks() -> Vec<StreamChunk> {
        vec![
            StreamChunk::Token("Hola, ".into()),
            StreamChunk::Token("Hello, ".into()),
            StreamChunk::Token("Bonjour!".into()),
            StreamChunk::Done,
        ]
    }

    async fn collect(mut s: ChunkStream) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        while let Some(c) = s.next().await {
            out.push(c);
        }
        out
    }

    #[test]
    fn keys_normalize_whitespace() {
        assert_eq!(cache_key("  say hi  "), cache_key("say hi"));
        assert_ne!(cache_key("say hi"), cache_key("say bye"));
    }

    #[tokio::test]
    async fn identical_prompts_replay_and_generate_once() {
        let cache = StreamingCache::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut outputs = Vec::new();
        for _ in 0..2 {
            let calls = calls.clone();
            let stream = cache
                .get_or_stream("say hi in 3 languages", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(scripted(hello_chunks()))
                })
                .await
                .unwrap();
            outputs.push(collect(stream).await);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(outputs[0], hello_chunks());
    }

    #[tokio::test]
    async fn concurrent_misses_invoke_generator_exactly_once() {
        let cache = Arc::new(StreamingCache::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let run = |cache: Arc<StreamingCache>, calls: Arc<AtomicUsize>| async move {
            let stream = cache
                .get_or_stream("same prompt", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    // Stay in flight long enough for the second caller to
                    // observe the pending marker.
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(scripted(hello_chunks()))
                })
                .await
                .unwrap();
            collect(stream).await
        };

        let (a, b) = tokio::join!(
            run(cache.clone(), calls.clone()),
            run(cache.clone(), calls.clone())
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a, b);
        assert_eq!(a, hello_chunks());
    }

    #[tokio::test]
    async fn expired_entries_are_regenerated() {
        let cache = StreamingCache::new(CacheConfig {
            ttl: Duration::from_millis(10),
            max_entries: 256,
        });
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let stream = cache
                .get_or_stream("ephemeral", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(scripted(hello_chunks()))
                })
                .await
                .unwrap();
            collect(stream).await;
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn incomplete_streams_are_not_cached() {
        let cache = StreamingCache::default();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let stream = cache
                .get_or_stream("truncated", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    // No Done marker.
                    Ok(scripted(vec![StreamChunk::Token("partial".into())]))
                })
                .await
                .unwrap();
            collect(stream).await;
            // Let the producer task finish its bookkeeping.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn consumer_dropping_early_clears_the_marker() {
        let cache = StreamingCache::default();
        let calls = Arc::new(AtomicUsize::new(0));

        // A long stream so the producer outlives the consumer's one poll.
        let long: Vec<StreamChunk> = (0..100)
            .map(|i| StreamChunk::Token(format!("t{i}")))
            .chain(std::iter::once(StreamChunk::Done))
            .collect();

        {
            let calls = calls.clone();
            let long = long.clone();
            let mut stream = cache
                .get_or_stream("abandoned", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(scripted(long))
                })
                .await
                .unwrap();
            let _first = stream.next().await;
            // Dropped here, well before completion.
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The key is free again; a new caller becomes the producer.
        let calls2 = calls.clone();
        let stream = cache
            .get_or_stream("abandoned", move || async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(scripted(hello_chunks()))
            })
            .await
            .unwrap();
        assert_eq!(collect(stream).await, hello_chunks());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn size_bound_evicts_oldest_entry() {
        let cache = StreamingCache::new(CacheConfig {
            ttl: Duration::from_secs(3600),
            max_entries: 2,
        });

        for prompt in ["one", "two", "three"] {
            let stream = cache
                .get_or_stream(prompt, move || async move { Ok(scripted(hello_chunks())) })
                .await
                .unwrap();
            collect(stream).await;
            // Instant has coarse granularity on some platforms; space the
            // entries out so oldest-first is well defined.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(cache.len(), 2);
        // "one" was evicted: generating it again calls the generator.
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let stream = cache
            .get_or_stream("one", move || async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(scripted(hello_chunks()))
            })
            .await
            .unwrap();
        collect(stream).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn generator_error_propagates_and_frees_the_key() {
        let cache = StreamingCache::default();
        let result = cache
            .get_or_stream("failing", || async {
                Err::<ChunkStream, _>(InferenceError::Transport {
                    message: "down".into(),
                })
            })
            .await;
        let err = match result {
            Ok(_) => panic!("expected generator error"),
            Err(e) => e,
        };
        assert!(matches!(err, InferenceError::Transport { .. }));

        // The failure did not wedge the key.
        let stream = cache
            .get_or_stream("failing", || async { Ok(scripted(hello_chunks())) })
            .await
            .unwrap();
        assert_eq!(collect(stream).await, hello_chunks());
    }
}
