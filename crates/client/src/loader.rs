//! Image loading for list-style consumers.
//!
//! A consumer slot (a recycled row, a cell) asks for a resource with
//! [`ImageLoader::load`]. The loader answers from the memory cache when it
//! can; otherwise it issues a per-consumer [`Ticket`] and routes it through
//! the scroll pacer to a per-resource [`InflightFetch`], so any number of
//! slots waiting on one resource share a single fetch.
//!
//! A fetch completes in this order: decode, memory cache, disk cache (only
//! for records that came from the origin and may be stored), removal from the
//! in-flight registry, delivery to every live waiter, then removal of each
//! waiter from the slot registry. A canceled fetch touches neither cache; it
//! releases its waiters' slots and tells them.
//!
//! A stale disk hit is served at once and revalidated by a ticketless fetch
//! registered like any other, so it counts against the in-flight capacity,
//! coalesces with later loads of the same key and dies with
//! [`ImageLoader::destroy`].

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use lumen_core::{AppConfig, CacheRecord, DiskCache, Error, MemoryCache};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::fetch::{FetchSource, FetchedResource, Fetcher, is_no_store, now_ms};
use crate::pacing::{PauseOnScroll, ScrollPacer, ScrollState, Submission};
use crate::registry::{InflightRegistry, SlotRegistry};
use crate::request::{CancelFlag, Cancellable, RequestId};

/// Turns fetched bytes into a decoded value. Runs on the blocking pool.
pub type Decoder<V> = Arc<dyn Fn(&str, &Bytes) -> Result<V, Error> + Send + Sync>;

/// Immediate answer of [`ImageLoader::load`].
#[derive(Debug)]
pub enum Load<V> {
    /// The key was empty; nothing to load.
    Empty,
    /// Served from the memory cache.
    Ready(V),
    /// Resolves when the fetch completes or the request is canceled.
    Pending(LoadReceiver<V>),
}

/// Future of a pending load. Resolves to `Err(Error::Canceled)` if the
/// request is superseded, evicted or torn down.
#[derive(Debug)]
pub struct LoadReceiver<V> {
    rx: oneshot::Receiver<Result<V, Error>>,
}

impl<V> Future for LoadReceiver<V> {
    type Output = Result<V, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Canceled)))
    }
}

struct TicketInner<S, V> {
    id: RequestId,
    slot: S,
    key: String,
    flag: CancelFlag,
    reply: Mutex<Option<oneshot::Sender<Result<V, Error>>>>,
}

/// One consumer's demand for one resource.
pub struct Ticket<S, V> {
    inner: Arc<TicketInner<S, V>>,
}

impl<S, V> Clone for Ticket<S, V> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S, V> Ticket<S, V> {
    fn new(slot: S, key: &str) -> (Self, LoadReceiver<V>) {
        let (tx, rx) = oneshot::channel();
        let inner = TicketInner {
            id: RequestId::next(),
            slot,
            key: key.to_string(),
            flag: CancelFlag::new(),
            reply: Mutex::new(Some(tx)),
        };
        (Self { inner: Arc::new(inner) }, LoadReceiver { rx })
    }

    pub fn slot(&self) -> &S {
        &self.inner.slot
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Hand `result` to the consumer unless the ticket was canceled.
    fn deliver(&self, result: Result<V, Error>) -> bool {
        if self.is_canceled() {
            return false;
        }
        match self.inner.reply.lock().take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

impl<S, V> Cancellable for Ticket<S, V> {
    fn id(&self) -> RequestId {
        self.inner.id
    }

    fn cancel(&self) {
        if self.inner.flag.cancel()
            && let Some(tx) = self.inner.reply.lock().take()
        {
            let _ = tx.send(Err(Error::Canceled));
        }
    }

    fn is_canceled(&self) -> bool {
        self.inner.flag.is_canceled()
    }
}

impl<S, V> fmt::Debug for Ticket<S, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

struct Waiters<S, V> {
    /// Set once the outcome is being delivered; no ticket may join after.
    finished: bool,
    tickets: Vec<Ticket<S, V>>,
}

struct FetchInner<S, V> {
    id: RequestId,
    key: String,
    flag: CancelFlag,
    waiters: Mutex<Waiters<S, V>>,
}

/// One outstanding fetch of one resource, shared by every waiting ticket.
pub struct InflightFetch<S, V> {
    inner: Arc<FetchInner<S, V>>,
}

impl<S, V> Clone for InflightFetch<S, V> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S, V> InflightFetch<S, V> {
    fn new(key: &str) -> Self {
        let inner = FetchInner {
            id: RequestId::next(),
            key: key.to_string(),
            flag: CancelFlag::new(),
            waiters: Mutex::new(Waiters { finished: false, tickets: Vec::new() }),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Number of tickets waiting, canceled ones included.
    pub fn waiters(&self) -> usize {
        self.inner.waiters.lock().tickets.len()
    }

    /// Join this fetch. Fails once the fetch has finished or was canceled.
    fn attach(&self, ticket: Ticket<S, V>) -> bool {
        let mut waiters = self.inner.waiters.lock();
        if waiters.finished || self.is_canceled() {
            return false;
        }
        waiters.tickets.push(ticket);
        true
    }

    /// Close the fetch to new tickets and take the ones waiting.
    fn finish(&self) -> Vec<Ticket<S, V>> {
        let mut waiters = self.inner.waiters.lock();
        waiters.finished = true;
        std::mem::take(&mut waiters.tickets)
    }

    /// Close the fetch if every waiting ticket has been canceled.
    fn close_if_abandoned(&self) -> bool {
        let mut waiters = self.inner.waiters.lock();
        let abandoned =
            !waiters.finished && !waiters.tickets.is_empty() && waiters.tickets.iter().all(Ticket::is_canceled);
        if abandoned {
            waiters.finished = true;
        }
        abandoned
    }

    async fn canceled(&self) {
        self.inner.flag.canceled().await;
    }
}

impl<S, V> Cancellable for InflightFetch<S, V> {
    fn id(&self) -> RequestId {
        self.inner.id
    }

    fn cancel(&self) {
        self.inner.flag.cancel();
    }

    fn is_canceled(&self) -> bool {
        self.inner.flag.is_canceled()
    }
}

impl<S, V> fmt::Debug for InflightFetch<S, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InflightFetch")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Loader tuning.
#[derive(Debug, Clone, Copy)]
pub struct LoaderOptions {
    /// Maximum outstanding fetches; the oldest is canceled beyond it.
    pub inflight_capacity: usize,
    pub pause: PauseOnScroll,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self { inflight_capacity: 32, pause: PauseOnScroll::default() }
    }
}

impl From<&AppConfig> for LoaderOptions {
    fn from(config: &AppConfig) -> Self {
        Self { inflight_capacity: config.inflight_capacity, pause: PauseOnScroll::from_config(config) }
    }
}

struct LoaderInner<S, V> {
    memory: MemoryCache<V>,
    slots: SlotRegistry<S, Ticket<S, V>>,
    inflight: InflightRegistry<InflightFetch<S, V>>,
    pacer: ScrollPacer<S, Ticket<S, V>>,
    fetcher: Arc<dyn Fetcher>,
    disk: Option<Arc<DiskCache>>,
    decoder: Decoder<V>,
    runtime: Handle,
}

/// Two-tier image loader with request coalescing and scroll pacing.
///
/// `S` identifies a consumer slot; `V` is the decoded value, cloned out of
/// the memory cache (use an `Arc` for large values).
pub struct ImageLoader<S, V> {
    inner: Arc<LoaderInner<S, V>>,
}

impl<S, V> Clone for ImageLoader<S, V> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S, V> ImageLoader<S, V>
where
    S: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a loader bound to the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` when called outside a Tokio runtime.
    pub fn new(
        memory: MemoryCache<V>, fetcher: Arc<dyn Fetcher>,
        decoder: impl Fn(&str, &Bytes) -> Result<V, Error> + Send + Sync + 'static, options: LoaderOptions,
        disk: Option<Arc<DiskCache>>,
    ) -> Result<Self, Error> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::InvalidInput(format!("image loader requires a Tokio runtime: {e}")))?;

        let inner = LoaderInner {
            memory,
            slots: SlotRegistry::new(),
            inflight: InflightRegistry::new(options.inflight_capacity),
            pacer: ScrollPacer::new(options.pause),
            fetcher,
            disk,
            decoder: Arc::new(decoder),
            runtime,
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    /// Create a loader sized and tuned from `config`: the memory cache gets
    /// `memory_fraction` of `memory_budget_bytes`, the rest comes from
    /// [`LoaderOptions::from`].
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` when called outside a Tokio runtime.
    pub fn from_config(
        config: &AppConfig, fetcher: Arc<dyn Fetcher>,
        decoder: impl Fn(&str, &Bytes) -> Result<V, Error> + Send + Sync + 'static,
        weigher: impl Fn(&str, &V) -> usize + Send + Sync + 'static, disk: Option<Arc<DiskCache>>,
    ) -> Result<Self, Error> {
        let memory = MemoryCache::with_fraction(config.memory_budget_bytes, config.memory_fraction, weigher);
        Self::new(memory, fetcher, decoder, LoaderOptions::from(config), disk)
    }

    /// Request `key` on behalf of `slot`, superseding the slot's previous request.
    pub fn load(&self, slot: S, key: &str) -> Load<V> {
        let inner = &self.inner;

        if key.is_empty() {
            if let Some(previous) = inner.slots.remove(&slot) {
                inner.release(&previous);
            }
            return Load::Empty;
        }

        if let Some(value) = inner.memory.get(key) {
            tracing::debug!(key, "memory cache hit");
            if let Some(previous) = inner.slots.remove(&slot) {
                inner.release(&previous);
            }
            return Load::Ready(value);
        }

        let (ticket, receiver) = Ticket::new(slot.clone(), key);
        let previous = inner.slots.put(slot.clone(), ticket.clone());

        match inner.pacer.submit(slot, ticket) {
            Submission::Dispatch(ticket) => inner.dispatch(ticket),
            Submission::Buffered => tracing::debug!(key, "dispatch paused, request buffered"),
        }

        if let Some(previous) = previous {
            inner.release(&previous);
        }
        Load::Pending(receiver)
    }

    /// Hold new requests until [`ImageLoader::resume`].
    pub fn pause(&self) {
        self.inner.pacer.pause();
    }

    /// Dispatch every request buffered while paused, in submission order.
    pub fn resume(&self) {
        let released = self.inner.pacer.resume();
        self.inner.dispatch_released(released);
    }

    pub fn on_scroll_state_changed(&self, state: ScrollState) {
        let released = self.inner.pacer.on_scroll_state_changed(state);
        self.inner.dispatch_released(released);
    }

    /// Cancel everything outstanding and empty the memory cache.
    pub fn destroy(&self) {
        let inner = &self.inner;
        let tickets = inner.slots.evict_all();
        let buffered = inner.pacer.cancel_all();
        let fetches = inner.inflight.evict_all();
        inner.memory.evict_all();
        tracing::debug!(tickets, buffered, fetches, "image loader destroyed");
    }

    pub fn memory(&self) -> &MemoryCache<V> {
        &self.inner.memory
    }

    pub fn disk(&self) -> Option<&Arc<DiskCache>> {
        self.inner.disk.as_ref()
    }

    /// Outstanding network fetches.
    pub fn inflight_len(&self) -> usize {
        self.inner.inflight.len()
    }

    /// Slots with a request still outstanding.
    pub fn pending_slots(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.pacer.is_paused()
    }
}

impl<S, V> LoaderInner<S, V>
where
    S: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn dispatch_released(self: &Arc<Self>, released: Vec<(S, Ticket<S, V>)>) {
        for (_, ticket) in released {
            if !ticket.is_canceled() {
                self.dispatch(ticket);
            }
        }
    }

    /// Attach `ticket` to the fetch for its key, starting one if needed.
    fn dispatch(self: &Arc<Self>, ticket: Ticket<S, V>) {
        if ticket.is_canceled() {
            return;
        }
        let key = ticket.key().to_string();

        if let Some(value) = self.memory.get(&key) {
            ticket.deliver(Ok(value));
            self.slots.remove_if(ticket.slot(), ticket.id());
            return;
        }

        loop {
            let fetch = InflightFetch::new(&key);
            fetch.attach(ticket.clone());

            match self.inflight.add(&key, fetch.clone()) {
                None => {
                    tracing::debug!(key = %key, id = %fetch.id(), "starting fetch");
                    let inner = Arc::clone(self);
                    self.runtime.spawn(async move { inner.run(fetch, false).await });
                    return;
                }
                Some(existing) => {
                    if existing.attach(ticket.clone()) {
                        tracing::debug!(key = %key, id = %existing.id(), "joined in-flight fetch");
                        return;
                    }
                    // finished or canceled but not yet removed: replace it
                    self.inflight.remove(&key, existing.id());
                }
            }
        }
    }

    /// Cancel `ticket` and, if nobody else waits on its fetch, the fetch too.
    fn release(&self, ticket: &Ticket<S, V>) {
        ticket.cancel();
        if let Some(fetch) = self.inflight.peek(ticket.key())
            && fetch.close_if_abandoned()
        {
            self.inflight.remove(ticket.key(), fetch.id());
            fetch.cancel();
            tracing::debug!(key = ticket.key(), id = %fetch.id(), "canceled abandoned fetch");
        }
    }

    /// Drive `fetch` to completion. `revalidate` goes to the origin even when
    /// a cached copy exists.
    async fn run(self: Arc<Self>, fetch: InflightFetch<S, V>, revalidate: bool) {
        let key = fetch.key().to_string();
        let request = if revalidate { self.fetcher.refresh(&key) } else { self.fetcher.fetch(&key) };

        let outcome = tokio::select! {
            biased;
            () = fetch.canceled() => None,
            result = request => Some(result),
        };

        let mut stale = false;
        let result = match outcome {
            Some(Ok(resource)) if !fetch.is_canceled() => {
                stale = !revalidate
                    && resource.source == FetchSource::DiskStale
                    && !resource.record.is_expired(now_ms());
                self.complete(&fetch, resource).await
            }
            Some(Err(e)) if !fetch.is_canceled() => Err(e),
            _ => Err(Error::Canceled),
        };

        if fetch.is_canceled() {
            for ticket in fetch.finish() {
                self.slots.remove_if(ticket.slot(), ticket.id());
                ticket.cancel();
            }
            tracing::debug!(key = %key, id = %fetch.id(), revalidate, "fetch canceled");
            return;
        }

        match &result {
            Err(e) if revalidate => tracing::warn!(key = %key, error = %e, "revalidation failed"),
            Err(e) => tracing::warn!(key = %key, error = %e, "load failed"),
            Ok(_) if revalidate => tracing::debug!(key = %key, "revalidated stale entry"),
            Ok(_) => {}
        }

        self.inflight.remove(&key, fetch.id());
        if stale && result.is_ok() {
            self.spawn_refresh(&key);
        }
        for ticket in fetch.finish() {
            ticket.deliver(result.clone());
            self.slots.remove_if(ticket.slot(), ticket.id());
        }
    }

    async fn complete(&self, fetch: &InflightFetch<S, V>, resource: FetchedResource) -> Result<V, Error> {
        let FetchedResource { record, source } = resource;
        let key = fetch.key();
        let value = self.decode(key, &record.payload).await?;
        if fetch.is_canceled() {
            return Err(Error::Canceled);
        }
        self.memory.put(key, value.clone());

        if source.is_from_origin() {
            self.persist(key, record).await;
        }
        Ok(value)
    }

    async fn decode(&self, key: &str, payload: &Bytes) -> Result<V, Error> {
        let decoder = Arc::clone(&self.decoder);
        let key = key.to_string();
        let payload = payload.clone();
        tokio::task::spawn_blocking(move || decoder(&key, &payload))
            .await
            .map_err(|e| Error::DecodeFailed(format!("decoder task failed: {e}")))?
    }

    async fn persist(&self, key: &str, record: CacheRecord) {
        let Some(disk) = self.disk.clone() else {
            return;
        };
        if is_no_store(&record) {
            tracing::debug!(key, "origin sent no-store, not persisted");
            return;
        }
        let owned_key = key.to_string();
        match tokio::task::spawn_blocking(move || disk.put(&owned_key, &record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(key, error = %e, "disk cache unavailable, not persisted"),
            Err(e) => tracing::warn!(key, error = %e, "disk cache write task failed"),
        }
    }

    /// Revalidate a stale record with a ticketless fetch. Skipped when a
    /// fetch for `key` is already outstanding.
    fn spawn_refresh(self: &Arc<Self>, key: &str) {
        let fetch = InflightFetch::new(key);
        if let Some(existing) = self.inflight.add(key, fetch.clone()) {
            tracing::debug!(key, id = %existing.id(), "fetch outstanding, refresh skipped");
            return;
        }
        tracing::debug!(key, id = %fetch.id(), "revalidating stale entry");
        let inner = Arc::clone(self);
        self.runtime.spawn(async move { inner.run(fetch, true).await });
    }
}

impl<S: PartialEq, V: Clone> fmt::Debug for ImageLoader<S, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageLoader")
            .field("inflight", &self.inner.inflight.len())
            .field("paused", &self.inner.pacer.is_paused())
            .field("memory_size", &self.inner.memory.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct ScriptedFetcher {
        responses: Mutex<HashMap<String, Result<FetchedResource, Error>>>,
        calls: Mutex<Vec<String>>,
        refreshes: AtomicUsize,
        gate: Option<Arc<Semaphore>>,
        refresh_gate: Option<Arc<Semaphore>>,
    }

    impl ScriptedFetcher {
        fn gated() -> (Self, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            (Self { gate: Some(Arc::clone(&gate)), ..Default::default() }, gate)
        }

        fn refresh_gated() -> (Self, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            (Self { refresh_gate: Some(Arc::clone(&gate)), ..Default::default() }, gate)
        }

        fn respond(self, key: &str, payload: &'static [u8], source: FetchSource) -> Self {
            let record = CacheRecord { soft_ttl: i64::MAX, ttl: i64::MAX, ..CacheRecord::new(key, payload) };
            self.responses.lock().insert(key.to_string(), Ok(FetchedResource { record, source }));
            self
        }

        fn respond_with(self, key: &str, record: CacheRecord, source: FetchSource) -> Self {
            self.responses.lock().insert(key.to_string(), Ok(FetchedResource { record, source }));
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, key: &str) -> Result<FetchedResource, Error> {
            self.calls.lock().push(key.to_string());
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            let scripted = self.responses.lock().get(key).cloned();
            scripted.unwrap_or_else(|| Err(Error::HttpError(format!("no response for {key}"))))
        }

        async fn refresh(&self, key: &str) -> Result<FetchedResource, Error> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.refresh_gate {
                gate.acquire().await.unwrap().forget();
            }
            let record = CacheRecord { soft_ttl: i64::MAX, ttl: i64::MAX, ..CacheRecord::new(key, "fresh") };
            Ok(FetchedResource { record, source: FetchSource::Network })
        }
    }

    fn decode_utf8(_key: &str, bytes: &Bytes) -> Result<String, Error> {
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::DecodeFailed(e.to_string()))
    }

    fn loader(fetcher: Arc<ScriptedFetcher>, capacity: usize, disk: Option<Arc<DiskCache>>) -> ImageLoader<u32, String> {
        let memory = MemoryCache::new(1024, |_, v: &String| v.len());
        let options = LoaderOptions { inflight_capacity: capacity, ..Default::default() };
        ImageLoader::new(memory, fetcher, decode_utf8, options, disk).unwrap()
    }

    fn pending(load: Load<String>) -> LoadReceiver<String> {
        match load {
            Load::Pending(receiver) => receiver,
            other => panic!("expected a pending load, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_then_memory_hit() {
        let fetcher = Arc::new(ScriptedFetcher::default().respond("k", b"one", FetchSource::Network));
        let loader = loader(Arc::clone(&fetcher), 8, None);

        assert_eq!(pending(loader.load(1, "k")).await.unwrap(), "one");
        assert!(matches!(loader.load(1, "k"), Load::Ready(v) if v == "one"));
        assert_eq!(fetcher.calls(), vec!["k"]);
        assert_eq!(loader.inflight_len(), 0);
        assert_eq!(loader.pending_slots(), 0);
    }

    #[tokio::test]
    async fn test_empty_key() {
        let loader = loader(Arc::new(ScriptedFetcher::default()), 8, None);
        assert!(matches!(loader.load(1, ""), Load::Empty));
    }

    #[tokio::test]
    async fn test_coalesces_same_resource() {
        let (fetcher, gate) = ScriptedFetcher::gated();
        let fetcher = Arc::new(fetcher.respond("k", b"shared", FetchSource::Network));
        let loader = loader(Arc::clone(&fetcher), 8, None);

        let first = pending(loader.load(1, "k"));
        let second = pending(loader.load(2, "k"));
        assert_eq!(loader.inflight_len(), 1);

        gate.add_permits(1);
        assert_eq!(first.await.unwrap(), "shared");
        assert_eq!(second.await.unwrap(), "shared");
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_slot_supersede_cancels_previous() {
        let (fetcher, gate) = ScriptedFetcher::gated();
        let fetcher = Arc::new(fetcher.respond("b", b"B", FetchSource::Network));
        let loader = loader(Arc::clone(&fetcher), 8, None);

        let first = pending(loader.load(1, "a"));
        let second = pending(loader.load(1, "b"));

        assert!(matches!(first.await, Err(Error::Canceled)));
        assert_eq!(loader.inflight_len(), 1);

        gate.add_permits(1);
        assert_eq!(second.await.unwrap(), "B");
    }

    #[tokio::test]
    async fn test_shared_fetch_survives_one_cancel() {
        let (fetcher, gate) = ScriptedFetcher::gated();
        let fetcher = Arc::new(fetcher.respond("k", b"v", FetchSource::Network));
        let loader = loader(Arc::clone(&fetcher), 8, None);

        let first = pending(loader.load(1, "k"));
        let second = pending(loader.load(2, "k"));
        let _ = loader.load(1, "");

        assert!(matches!(first.await, Err(Error::Canceled)));
        assert_eq!(loader.inflight_len(), 1);
        gate.add_permits(1);
        assert_eq!(second.await.unwrap(), "v");
    }

    #[tokio::test]
    async fn test_capacity_eviction_cancels_oldest() {
        let (fetcher, gate) = ScriptedFetcher::gated();
        let fetcher = Arc::new(fetcher.respond("b", b"B", FetchSource::Network));
        let loader = loader(Arc::clone(&fetcher), 1, None);

        let first = pending(loader.load(1, "a"));
        let second = pending(loader.load(2, "b"));

        assert!(matches!(first.await, Err(Error::Canceled)));
        assert_eq!(loader.pending_slots(), 1);
        gate.add_permits(1);
        assert_eq!(second.await.unwrap(), "B");
        assert_eq!(loader.inflight_len(), 0);
        assert_eq!(loader.pending_slots(), 0);
    }

    #[tokio::test]
    async fn test_fetch_error_is_delivered() {
        let loader = loader(Arc::new(ScriptedFetcher::default()), 8, None);

        let result = pending(loader.load(1, "missing")).await;
        assert!(matches!(result, Err(Error::HttpError(_))));
        assert_eq!(loader.inflight_len(), 0);
        assert_eq!(loader.pending_slots(), 0);
    }

    #[tokio::test]
    async fn test_decode_error_is_delivered_and_not_cached() {
        let fetcher = Arc::new(ScriptedFetcher::default().respond("k", b"\xff\xfe", FetchSource::Network));
        let loader = loader(fetcher, 8, None);

        let result = pending(loader.load(1, "k")).await;
        assert!(matches!(result, Err(Error::DecodeFailed(_))));
        assert!(!loader.memory().contains("k"));
        assert_eq!(loader.inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_memory_hit_cancels_pending_ticket() {
        let (fetcher, _gate) = ScriptedFetcher::gated();
        let loader = loader(Arc::new(fetcher), 8, None);

        let first = pending(loader.load(1, "a"));
        loader.memory().put("b", "B".to_string());
        assert!(matches!(loader.load(1, "b"), Load::Ready(v) if v == "B"));

        assert!(matches!(first.await, Err(Error::Canceled)));
        assert_eq!(loader.inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_pause_buffers_until_resume() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .respond("a", b"A", FetchSource::Network)
                .respond("b", b"B", FetchSource::Network)
                .respond("c", b"C", FetchSource::Network),
        );
        let loader = loader(Arc::clone(&fetcher), 8, None);

        loader.pause();
        let receivers: Vec<_> = [(1, "a"), (2, "b"), (3, "c")]
            .into_iter()
            .map(|(slot, key)| pending(loader.load(slot, key)))
            .collect();
        tokio::task::yield_now().await;
        assert!(fetcher.calls().is_empty());
        assert_eq!(loader.inflight_len(), 0);

        loader.resume();
        let mut values = Vec::new();
        for receiver in receivers {
            values.push(receiver.await.unwrap());
        }
        assert_eq!(values, vec!["A", "B", "C"]);
        assert_eq!(fetcher.calls(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_scroll_states_drive_pacing() {
        let fetcher = Arc::new(ScriptedFetcher::default().respond("a", b"A", FetchSource::Network));
        let loader = loader(fetcher, 8, None);

        loader.on_scroll_state_changed(ScrollState::Settling);
        assert!(loader.is_paused());
        let receiver = pending(loader.load(1, "a"));

        loader.on_scroll_state_changed(ScrollState::Idle);
        assert!(!loader.is_paused());
        assert_eq!(receiver.await.unwrap(), "A");
    }

    #[tokio::test]
    async fn test_destroy_cancels_everything() {
        let (fetcher, _gate) = ScriptedFetcher::gated();
        let loader = loader(Arc::new(fetcher), 8, None);
        loader.memory().put("cached", "x".to_string());

        let active = pending(loader.load(1, "a"));
        loader.pause();
        let buffered = pending(loader.load(2, "b"));

        loader.destroy();
        assert!(matches!(active.await, Err(Error::Canceled)));
        assert!(matches!(buffered.await, Err(Error::Canceled)));
        assert!(loader.memory().is_empty());
        assert_eq!(loader.inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_origin_records_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let disk: Arc<DiskCache> = Arc::new(DiskCache::new(dir.path(), 1024 * 1024, 1));
        disk.initialize().unwrap();

        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .respond("net", b"N", FetchSource::Network)
                .respond("mem", b"M", FetchSource::DiskFresh),
        );
        let loader = loader(fetcher, 8, Some(Arc::clone(&disk)));

        assert_eq!(pending(loader.load(1, "net")).await.unwrap(), "N");
        assert_eq!(pending(loader.load(2, "mem")).await.unwrap(), "M");

        assert_eq!(&disk.get("net").unwrap().unwrap().payload[..], b"N");
        assert!(disk.get("mem").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_store_record_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let disk: Arc<DiskCache> = Arc::new(DiskCache::new(dir.path(), 1024 * 1024, 1));
        disk.initialize().unwrap();

        let mut record = CacheRecord { soft_ttl: i64::MAX, ttl: i64::MAX, ..CacheRecord::new("k", "secret") };
        record.response_headers.insert("cache-control".to_string(), "private, no-store".to_string());
        let fetcher = Arc::new(ScriptedFetcher::default().respond_with("k", record, FetchSource::Network));
        let loader = loader(fetcher, 8, Some(Arc::clone(&disk)));

        assert_eq!(pending(loader.load(1, "k")).await.unwrap(), "secret");
        assert!(loader.memory().contains("k"));
        assert!(!disk.contains("k").unwrap());
    }

    #[tokio::test]
    async fn test_stale_record_served_then_refreshed() {
        let stale = CacheRecord { soft_ttl: 0, ttl: i64::MAX, ..CacheRecord::new("k", "old") };
        let fetcher = Arc::new(ScriptedFetcher::default().respond_with("k", stale, FetchSource::DiskStale));
        let loader = loader(Arc::clone(&fetcher), 8, None);

        assert_eq!(pending(loader.load(1, "k")).await.unwrap(), "old");

        for _ in 0..200 {
            if loader.memory().get("k").as_deref() == Some("fresh") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fetcher.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(loader.memory().get("k").as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_refreshes_are_bounded_and_die_with_destroy() {
        let (fetcher, refresh_gate) = ScriptedFetcher::refresh_gated();
        let fetcher = ["a", "b", "c"].into_iter().fold(fetcher, |fetcher, key| {
            let stale = CacheRecord { soft_ttl: 0, ttl: i64::MAX, ..CacheRecord::new(key, "old") };
            fetcher.respond_with(key, stale, FetchSource::DiskStale)
        });
        let loader = loader(Arc::new(fetcher), 1, None);

        for (slot, key) in [(1, "a"), (2, "b"), (3, "c")] {
            assert_eq!(pending(loader.load(slot, key)).await.unwrap(), "old");
            assert_eq!(loader.inflight_len(), 1, "after {key}");
        }

        loader.destroy();
        assert_eq!(loader.inflight_len(), 0);

        refresh_gate.add_permits(3);
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for key in ["a", "b", "c"] {
            assert!(!loader.memory().contains(key), "{key} repopulated after destroy");
        }
    }

    #[tokio::test]
    async fn test_load_joins_outstanding_refresh() {
        let (fetcher, refresh_gate) = ScriptedFetcher::refresh_gated();
        let stale = CacheRecord { soft_ttl: 0, ttl: i64::MAX, ..CacheRecord::new("k", "old") };
        let fetcher = Arc::new(fetcher.respond_with("k", stale, FetchSource::DiskStale));
        let loader = loader(Arc::clone(&fetcher), 8, None);

        assert_eq!(pending(loader.load(1, "k")).await.unwrap(), "old");
        assert_eq!(loader.inflight_len(), 1);

        loader.memory().remove("k");
        let receiver = pending(loader.load(2, "k"));
        assert_eq!(loader.inflight_len(), 1);
        assert_eq!(fetcher.calls().len(), 1);

        refresh_gate.add_permits(1);
        assert_eq!(receiver.await.unwrap(), "fresh");
        assert_eq!(fetcher.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(loader.inflight_len(), 0);
        assert_eq!(loader.pending_slots(), 0);
    }

    #[tokio::test]
    async fn test_from_config_sizes_memory_and_options() {
        let config = AppConfig {
            memory_budget_bytes: 8192,
            memory_fraction: 0.25,
            inflight_capacity: 1,
            pause_on_scroll: true,
            ..Default::default()
        };
        let fetcher = Arc::new(ScriptedFetcher::default());
        let loader: ImageLoader<u32, String> =
            ImageLoader::from_config(&config, fetcher, decode_utf8, |_, v: &String| v.len(), None).unwrap();

        assert_eq!(loader.memory().max_size(), 2048);
        loader.on_scroll_state_changed(ScrollState::Dragging);
        assert!(loader.is_paused());
    }

    #[tokio::test]
    async fn test_debug_output() {
        let loader = loader(Arc::new(ScriptedFetcher::default()), 8, None);
        loader.pause();
        let rendered = format!("{loader:?}");
        assert!(rendered.starts_with("ImageLoader"));
        assert!(rendered.contains("paused: true"));
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let memory: MemoryCache<String> = MemoryCache::new(16, |_, v: &String| v.len());
        let result: Result<ImageLoader<u32, String>, Error> = ImageLoader::new(
            memory,
            Arc::new(ScriptedFetcher::default()),
            decode_utf8,
            LoaderOptions::default(),
            None,
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
