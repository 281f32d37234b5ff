#![forbid(unsafe_code)]

//! Result cache and request coalescing around the pipeline.
//!
//! Per key the cache moves through `Absent -> Computing -> Cached`, and back
//! to `Computing` once an entry outlives its TTL. Concurrent requests for a
//! key that is `Computing` wait on the same computation. Computations run on
//! their own task, so a caller that gives up does not cancel work that other
//! waiters (or later requests) still need.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dq_pipeline::{PipelineError, PipelineSpec, ValidatedPipeline};
use dq_runtime::{Diagnostic, DiagnosticLedger, RuntimePolicy, Stage};
use dq_types::Row;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::Instant;

// ── Configuration ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Freshness window of a cached result (default: 60 seconds).
    pub ttl: Duration,
    /// When false nothing is stored; in-flight coalescing still applies.
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            enabled: true,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

// ── Errors ──────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("fetching rows for {identity:?} failed: {message}")]
pub struct FetchError {
    pub identity: String,
    pub message: String,
}

impl FetchError {
    pub fn new(identity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            message: message.into(),
        }
    }
}

/// A fatal pipeline error together with the spec that produced it.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("pipeline failed during {stage}: {source}")]
pub struct PipelineFailure {
    pub stage: Stage,
    pub spec: Box<PipelineSpec>,
    pub source: PipelineError,
}

#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(Box<PipelineFailure>),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("could not encode cache key: {0}")]
    KeyEncoding(Arc<serde_json::Error>),
    #[error("pipeline task ended without a result: {0}")]
    Aborted(String),
}

impl From<PipelineFailure> for EngineError {
    fn from(failure: PipelineFailure) -> Self {
        Self::Pipeline(Box::new(failure))
    }
}

// ── Keys ────────────────────────────────────────────────────────────────

fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Content address of a request: the source identity plus a digest of the
/// source identity, the serialized pipeline spec and the runtime policy the
/// rows were produced under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    source: String,
    digest: String,
}

impl CacheKey {
    pub fn compute(
        source: &str,
        spec: &PipelineSpec,
        policy: &RuntimePolicy,
    ) -> Result<Self, EngineError> {
        #[derive(Serialize)]
        struct KeyMaterial<'a> {
            source: &'a str,
            pipeline: &'a PipelineSpec,
            policy: &'a RuntimePolicy,
        }

        let material = serde_json::to_vec(&KeyMaterial {
            source,
            pipeline: spec,
            policy,
        })
        .map_err(|err| EngineError::KeyEncoding(Arc::new(err)))?;
        Ok(Self {
            source: source.to_owned(),
            digest: hash_bytes(&material),
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@sha256:{}", self.source, self.digest)
    }
}

// ── Cache service ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    pub rows: Vec<Row>,
    pub refreshed_at: DateTime<Utc>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Requests that waited on another request's computation.
    pub coalesced: u64,
    /// Entries dropped because a read found them expired.
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
}

impl StatCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

struct CacheEntry {
    result: Arc<CachedResult>,
    stored_at: Instant,
}

type ComputationResult = Result<Arc<CachedResult>, EngineError>;
type SharedComputation = Shared<BoxFuture<'static, ComputationResult>>;

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    in_flight: HashMap<CacheKey, SharedComputation>,
}

/// Process-wide result cache, owned by whoever builds the engine.
///
/// The lock is only held for map bookkeeping, never across a fetch or a
/// pipeline run, so requests for different keys do not wait on each other.
pub struct QueryCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
    stats: StatCounters,
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("QueryCache")
            .field("config", &self.config)
            .field("entries", &state.entries.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl QueryCache {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
            stats: StatCounters::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, state: &mut CacheState, key: &CacheKey) -> Option<Arc<CachedResult>> {
        if !self.config.enabled {
            StatCounters::bump(&self.stats.misses);
            return None;
        }
        let fresh = state
            .entries
            .get(key)
            .map(|entry| entry.stored_at.elapsed() < self.config.ttl);
        match fresh {
            Some(true) => {
                StatCounters::bump(&self.stats.hits);
                state.entries.get(key).map(|entry| Arc::clone(&entry.result))
            }
            Some(false) => {
                state.entries.remove(key);
                StatCounters::bump(&self.stats.evictions);
                StatCounters::bump(&self.stats.misses);
                tracing::debug!(%key, "cache entry expired");
                None
            }
            None => {
                StatCounters::bump(&self.stats.misses);
                None
            }
        }
    }

    fn store(&self, state: &mut CacheState, key: CacheKey, result: Arc<CachedResult>) {
        if !self.config.enabled {
            return;
        }
        state.entries.insert(
            key,
            CacheEntry {
                result,
                stored_at: Instant::now(),
            },
        );
    }

    /// Fresh entry for `key`, if any. An expired entry is removed.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CachedResult>> {
        let mut state = self.lock();
        self.lookup(&mut state, key)
    }

    pub fn put(&self, key: CacheKey, result: Arc<CachedResult>) {
        let mut state = self.lock();
        self.store(&mut state, key, result);
    }

    /// Drop the entry for `key`. A computation already running is unaffected.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    /// Drop every entry computed from `source`; returns how many were removed.
    pub fn invalidate_source(&self, source: &str) -> usize {
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|key, _| key.source != source);
        before - state.entries.len()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently being computed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }
}

/// Clears the in-flight slot of a computation however it ends, including a
/// panic inside the task.
struct InFlightGuard {
    cache: Arc<QueryCache>,
    key: CacheKey,
    settled: bool,
}

impl InFlightGuard {
    fn settle(&mut self, outcome: &ComputationResult) {
        let mut state = self.cache.lock();
        state.in_flight.remove(&self.key);
        match outcome {
            Ok(result) => {
                self.cache
                    .store(&mut state, self.key.clone(), Arc::clone(result));
                tracing::debug!(key = %self.key, rows = result.rows.len(), "computation cached");
            }
            Err(err) => {
                tracing::warn!(key = %self.key, error = %err, "computation failed");
            }
        }
        self.settled = true;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.cache.lock().in_flight.remove(&self.key);
        }
    }
}

// ── Row sources ─────────────────────────────────────────────────────────

pub type SourceRows = Arc<Vec<Row>>;
pub type FetchFuture = BoxFuture<'static, Result<SourceRows, FetchError>>;

/// Where a request's raw rows come from.
///
/// `identity` must be stable for the same underlying data: it is half of the
/// cache key.
pub trait RowSource: Send + Sync + fmt::Debug {
    fn identity(&self) -> &str;

    fn fetch(&self) -> FetchFuture;
}

/// Rows that are already in memory.
#[derive(Debug, Clone)]
pub struct InlineSource {
    identity: String,
    rows: SourceRows,
}

impl InlineSource {
    pub fn new(identity: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            identity: identity.into(),
            rows: Arc::new(rows),
        }
    }

    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }
}

impl RowSource for InlineSource {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn fetch(&self) -> FetchFuture {
        futures::future::ready(Ok(Arc::clone(&self.rows))).boxed()
    }
}

/// Rows produced by an async callback, e.g. an HTTP adapter.
pub struct FnSource<F> {
    identity: String,
    fetch: F,
}

impl<F, Fut> FnSource<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<Row>, FetchError>> + Send + 'static,
{
    pub fn new(identity: impl Into<String>, fetch: F) -> Self {
        Self {
            identity: identity.into(),
            fetch,
        }
    }
}

impl<F> fmt::Debug for FnSource<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnSource")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl<F, Fut> RowSource for FnSource<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<Row>, FetchError>> + Send + 'static,
{
    fn identity(&self) -> &str {
        &self.identity
    }

    fn fetch(&self) -> FetchFuture {
        (self.fetch)().map(|rows| rows.map(Arc::new)).boxed()
    }
}

// ── Engine ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub source: Arc<dyn RowSource>,
    pub spec: PipelineSpec,
    /// Skip the cache read; the fresh result still replaces the entry.
    pub bypass_cache: bool,
}

impl PipelineRequest {
    pub fn new(source: Arc<dyn RowSource>, spec: PipelineSpec) -> Self {
        Self {
            source,
            spec,
            bypass_cache: false,
        }
    }

    #[must_use]
    pub fn bypassing_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputMetadata {
    pub refreshed_at: DateTime<Utc>,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineOutput {
    pub rows: Vec<Row>,
    pub metadata: OutputMetadata,
    pub diagnostics: Vec<Diagnostic>,
}

impl PipelineOutput {
    fn from_result(result: &CachedResult, cache_hit: bool) -> Self {
        Self {
            rows: result.rows.clone(),
            metadata: OutputMetadata {
                refreshed_at: result.refreshed_at,
                cache_hit,
            },
            diagnostics: result.diagnostics.clone(),
        }
    }
}

/// Runs pipeline requests through a shared [`QueryCache`].
///
/// Needs a tokio runtime: misses are computed on a spawned task.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    cache: Arc<QueryCache>,
    policy: RuntimePolicy,
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self::new(Arc::new(QueryCache::default()), RuntimePolicy::default())
    }
}

impl QueryEngine {
    #[must_use]
    pub fn new(cache: Arc<QueryCache>, policy: RuntimePolicy) -> Self {
        Self { cache, policy }
    }

    #[must_use]
    pub fn with_config(config: CacheConfig) -> Self {
        Self::new(Arc::new(QueryCache::new(config)), RuntimePolicy::default())
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    #[must_use]
    pub fn policy(&self) -> &RuntimePolicy {
        &self.policy
    }

    /// Answer `request` from the cache, from a computation already running for
    /// the same key, or by fetching and running the pipeline.
    ///
    /// Spec errors are reported before the cache is consulted.
    pub async fn execute(&self, request: PipelineRequest) -> Result<PipelineOutput, EngineError> {
        let PipelineRequest {
            source,
            spec,
            bypass_cache,
        } = request;

        let mut ledger = DiagnosticLedger::new();
        let pipeline = match spec.validate(&self.policy, &mut ledger) {
            Ok(pipeline) => pipeline,
            Err(source) => {
                return Err(PipelineFailure {
                    stage: Stage::Validate,
                    spec: Box::new(spec),
                    source,
                }
                .into());
            }
        };
        let key = CacheKey::compute(source.identity(), &spec, &self.policy)?;

        let computation = {
            let mut state = self.cache.lock();
            if !bypass_cache
                && let Some(result) = self.cache.lookup(&mut state, &key)
            {
                tracing::debug!(%key, "cache hit");
                return Ok(PipelineOutput::from_result(&result, true));
            }
            if let Some(pending) = state.in_flight.get(&key) {
                StatCounters::bump(&self.cache.stats.coalesced);
                tracing::debug!(%key, "joining in-flight computation");
                pending.clone()
            } else {
                tracing::debug!(%key, bypass_cache, "starting computation");
                let computation = self.spawn_computation(key.clone(), source, pipeline, ledger);
                state.in_flight.insert(key, computation.clone());
                computation
            }
        };

        let result = computation.await?;
        Ok(PipelineOutput::from_result(&result, false))
    }

    fn spawn_computation(
        &self,
        key: CacheKey,
        source: Arc<dyn RowSource>,
        pipeline: ValidatedPipeline,
        ledger: DiagnosticLedger,
    ) -> SharedComputation {
        let mut guard = InFlightGuard {
            cache: Arc::clone(&self.cache),
            key,
            settled: false,
        };
        let policy = self.policy.clone();
        let handle = tokio::spawn(async move {
            let outcome = compute(source.as_ref(), &pipeline, &policy, ledger).await;
            guard.settle(&outcome);
            outcome
        });
        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(err) => Err(EngineError::Aborted(err.to_string())),
            }
        }
        .boxed()
        .shared()
    }
}

/// Fetch is the only suspension point; the pipeline itself runs to
/// completion without yielding.
async fn compute(
    source: &dyn RowSource,
    pipeline: &ValidatedPipeline,
    policy: &RuntimePolicy,
    mut ledger: DiagnosticLedger,
) -> ComputationResult {
    let rows = source.fetch().await?;
    let out = pipeline.execute(&rows, policy, &mut ledger);
    Ok(Arc::new(CachedResult {
        rows: out,
        refreshed_at: Utc::now(),
        diagnostics: ledger.into_records(),
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use dq_filter::{FilterRule, FilterTree};
    use dq_groupby::Dimension;
    use dq_pipeline::{MeasureSpec, PipelineSpec};
    use dq_runtime::{DiagnosticKind, RuntimePolicy, Stage};
    use dq_types::{Row, Scalar};

    use super::{
        CacheConfig, CacheKey, EngineError, FetchError, FnSource, InlineSource, PipelineRequest,
        QueryCache, QueryEngine, RowSource,
    };

    fn sales() -> Vec<Row> {
        vec![
            Row::from_pairs([("region", Scalar::from("North")), ("revenue", Scalar::Int64(1000))]),
            Row::from_pairs([("region", Scalar::from("North")), ("revenue", Scalar::Int64(1500))]),
            Row::from_pairs([("region", Scalar::from("South")), ("revenue", Scalar::Int64(1200))]),
        ]
    }

    fn revenue_by_region() -> PipelineSpec {
        PipelineSpec {
            dimensions: vec![Dimension::field("region")],
            measures: vec![MeasureSpec::aggregated("revenue", "sum", "total_revenue")],
            ..PipelineSpec::default()
        }
    }

    /// A source that sleeps for `delay` and counts how often it was fetched.
    fn counting_source(
        identity: &str,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    ) -> Arc<dyn RowSource> {
        Arc::new(FnSource::new(identity, move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(sales())
            }
        }))
    }

    #[test]
    fn key_is_a_pure_function_of_source_spec_and_policy() {
        let spec = revenue_by_region();
        let policy = RuntimePolicy::default();
        let a = CacheKey::compute("sales", &spec, &policy).expect("key");
        let b = CacheKey::compute("sales", &spec.clone(), &policy.clone()).expect("key");
        assert_eq!(a, b);

        let other_source = CacheKey::compute("returns", &spec, &policy).expect("key");
        assert_ne!(a, other_source);

        let strict = CacheKey::compute("sales", &spec, &RuntimePolicy::strict()).expect("key");
        assert_ne!(a, strict);

        let limited = PipelineSpec {
            limit: Some(1),
            ..spec
        };
        assert_ne!(a, CacheKey::compute("sales", &limited, &policy).expect("key"));
        assert_eq!(a.digest().len(), 64);
    }

    #[tokio::test]
    async fn engines_with_different_policies_do_not_share_entries() {
        let cache = Arc::new(QueryCache::default());
        let permissive = QueryEngine::new(Arc::clone(&cache), RuntimePolicy::permissive());
        let strict = QueryEngine::new(Arc::clone(&cache), RuntimePolicy::strict());
        let source: Arc<dyn RowSource> = Arc::new(InlineSource::new("sales", sales()));
        let request = PipelineRequest::new(
            source,
            PipelineSpec {
                limit: Some(0),
                ..revenue_by_region()
            },
        );

        let loose = permissive.execute(request.clone()).await.expect("permissive");
        assert_eq!(loose.rows.len(), 2);

        let literal = strict.execute(request.clone()).await.expect("strict");
        assert!(!literal.metadata.cache_hit);
        assert!(literal.rows.is_empty());

        let again = strict.execute(request).await.expect("strict again");
        assert!(again.metadata.cache_hit);
        assert!(again.rows.is_empty());
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn second_identical_request_is_a_cache_hit() {
        let engine = QueryEngine::default();
        let source: Arc<dyn RowSource> = Arc::new(InlineSource::new("sales", sales()));
        let request = PipelineRequest::new(source, revenue_by_region());

        let first = engine.execute(request.clone()).await.expect("first");
        let second = engine.execute(request).await.expect("second");

        assert!(!first.metadata.cache_hit);
        assert!(second.metadata.cache_hit);
        assert_eq!(first.rows, second.rows);
        assert_eq!(first.metadata.refreshed_at, second.metadata.refreshed_at);
        assert_eq!(first.rows[0].value("total_revenue"), &Scalar::Float64(2500.0));
        let stats = engine.cache().stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_identical_requests_fetch_once() {
        let engine = QueryEngine::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = counting_source("slow", Duration::from_millis(50), Arc::clone(&calls));
        let request = PipelineRequest::new(source, revenue_by_region());

        let (a, b) = tokio::join!(
            engine.execute(request.clone()),
            engine.execute(request.clone())
        );
        let (a, b) = (a.expect("a"), b.expect("b"));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.rows, b.rows);
        assert_eq!(engine.cache().stats().coalesced, 1);
        assert_eq!(engine.cache().in_flight(), 0);
        assert_eq!(engine.cache().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_compute_independently() {
        let engine = QueryEngine::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = counting_source("slow", Duration::from_millis(50), Arc::clone(&calls));
        let limited = PipelineSpec {
            limit: Some(1),
            ..revenue_by_region()
        };

        let (a, b) = tokio::join!(
            engine.execute(PipelineRequest::new(Arc::clone(&source), revenue_by_region())),
            engine.execute(PipelineRequest::new(source, limited))
        );
        assert_eq!(a.expect("a").rows.len(), 2);
        assert_eq!(b.expect("b").rows.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.cache().stats().coalesced, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_recomputed() {
        let engine = QueryEngine::with_config(CacheConfig::default().with_ttl(Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));
        let source = counting_source("sales", Duration::ZERO, Arc::clone(&calls));
        let request = PipelineRequest::new(source, revenue_by_region());

        engine.execute(request.clone()).await.expect("first");
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(engine.execute(request.clone()).await.expect("fresh").metadata.cache_hit);

        tokio::time::advance(Duration::from_secs(31)).await;
        let expired = engine.execute(request).await.expect("expired");
        assert!(!expired.metadata.cache_hit);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.cache().stats().evictions, 1);
    }

    #[tokio::test]
    async fn bypass_recomputes_and_refreshes_the_entry() {
        let engine = QueryEngine::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = counting_source("sales", Duration::ZERO, Arc::clone(&calls));
        let request = PipelineRequest::new(source, revenue_by_region());

        engine.execute(request.clone()).await.expect("warm");
        let bypassed = engine
            .execute(request.clone().bypassing_cache())
            .await
            .expect("bypass");
        assert!(!bypassed.metadata.cache_hit);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let after = engine.execute(request).await.expect("after");
        assert!(after.metadata.cache_hit);
        assert_eq!(after.metadata.refreshed_at, bypassed.metadata.refreshed_at);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_reaches_every_waiter_and_leaves_no_entry() {
        let engine = QueryEngine::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let source: Arc<dyn RowSource> = Arc::new(FnSource::new("flaky", move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if attempt == 0 {
                    Err(FetchError::new("flaky", "connection reset"))
                } else {
                    Ok(sales())
                }
            }
        }));
        let request = PipelineRequest::new(source, revenue_by_region());

        let (a, b) = tokio::join!(
            engine.execute(request.clone()),
            engine.execute(request.clone())
        );
        assert!(matches!(a, Err(EngineError::Fetch(ref err)) if err.message == "connection reset"));
        assert!(matches!(b, Err(EngineError::Fetch(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(engine.cache().is_empty());
        assert_eq!(engine.cache().in_flight(), 0);

        let retry = engine.execute(request).await.expect("retry");
        assert_eq!(retry.rows.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_request_still_populates_the_cache() {
        let engine = QueryEngine::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = counting_source("slow", Duration::from_millis(50), Arc::clone(&calls));
        let request = PipelineRequest::new(source, revenue_by_region());

        let abandoned =
            tokio::time::timeout(Duration::from_millis(5), engine.execute(request.clone())).await;
        assert!(abandoned.is_err());
        assert_eq!(engine.cache().in_flight(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.cache().in_flight(), 0);
        assert_eq!(engine.cache().len(), 1);

        let later = engine.execute(request).await.expect("later");
        assert!(later.metadata.cache_hit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spec_errors_fail_before_fetching() {
        let engine = QueryEngine::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = counting_source("sales", Duration::ZERO, Arc::clone(&calls));
        let spec = PipelineSpec {
            measures: vec![MeasureSpec::aggregated("revenue", "median", "m")],
            ..PipelineSpec::default()
        };

        let err = engine
            .execute(PipelineRequest::new(source, spec.clone()))
            .await
            .expect_err("unknown aggregation");
        let failure = match err {
            EngineError::Pipeline(failure) => failure,
            other => panic!("expected a pipeline failure, got {other:?}"),
        };
        assert_eq!(failure.stage, Stage::Validate);
        assert_eq!(*failure.spec, spec);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(engine.cache().is_empty());
    }

    #[tokio::test]
    async fn diagnostics_travel_with_cached_results() {
        let engine = QueryEngine::default();
        let source: Arc<dyn RowSource> = Arc::new(InlineSource::new("sales", sales()));
        let spec = PipelineSpec {
            filters: FilterTree::and(vec![FilterRule::new("colour", "=", Scalar::from("red"))]),
            ..revenue_by_region()
        };
        let request = PipelineRequest::new(source, spec);

        let first = engine.execute(request.clone()).await.expect("first");
        let cached = engine.execute(request).await.expect("cached");
        assert!(first.rows.is_empty());
        assert_eq!(first.diagnostics.len(), 1);
        assert_eq!(first.diagnostics[0].kind, DiagnosticKind::UnknownFilterField);
        assert_eq!(cached.diagnostics, first.diagnostics);
    }

    #[tokio::test]
    async fn invalidation_by_key_and_source() {
        let engine = QueryEngine::default();
        let sales_source: Arc<dyn RowSource> = Arc::new(InlineSource::new("sales", sales()));
        let other_source: Arc<dyn RowSource> = Arc::new(InlineSource::new("other", sales()));
        let limited = PipelineSpec {
            limit: Some(1),
            ..revenue_by_region()
        };

        for request in [
            PipelineRequest::new(Arc::clone(&sales_source), revenue_by_region()),
            PipelineRequest::new(Arc::clone(&sales_source), limited),
            PipelineRequest::new(other_source, revenue_by_region()),
        ] {
            engine.execute(request).await.expect("warm");
        }
        let cache = engine.cache();
        assert_eq!(cache.len(), 3);

        let key = CacheKey::compute("other", &revenue_by_region(), engine.policy()).expect("key");
        assert!(cache.get(&key).is_some());
        assert!(cache.invalidate(&key));
        assert!(!cache.invalidate(&key));
        assert_eq!(cache.invalidate_source("sales"), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn disabled_cache_never_hits() {
        let engine = QueryEngine::with_config(CacheConfig::default().disabled());
        let calls = Arc::new(AtomicUsize::new(0));
        let source = counting_source("sales", Duration::ZERO, Arc::clone(&calls));
        let request = PipelineRequest::new(source, revenue_by_region());

        engine.execute(request.clone()).await.expect("first");
        let second = engine.execute(request).await.expect("second");
        assert!(!second.metadata.cache_hit);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(engine.cache().is_empty());
    }
}
