//! # Controller module
//!
//! This module provide the per-type controller runtime, event sources feed a
//! typed queue through predicates, a fixed worker pool drains it

use std::{collections::HashMap, fmt::Debug, hash::Hash, sync::Arc};

use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    runtime::watcher::{self, watcher, Event},
    Api, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::svc::k8s::{
    process,
    queue::{Queue, RateLimiter},
    Outcome, Reconcile, Request, State,
};

// -----------------------------------------------------------------------------
// Mapper trait

/// maps one watch event to the requests it fans out to, the fingerprint
/// filters no-op updates before anything is enqueued
#[async_trait]
pub trait Mapper<K>: Send + Sync + 'static {
    async fn map(&self, obj: &K, state: &Arc<State>) -> Vec<Request>;

    /// `None` disables the no-op filter for this source
    fn fingerprint(&self, _obj: &K) -> Option<u64> {
        None
    }
}

// -----------------------------------------------------------------------------
// IdentityMapper structure

/// enqueue the object itself, the default source of every controller
pub struct IdentityMapper;

#[async_trait]
impl<K> Mapper<K> for IdentityMapper
where
    K: ResourceExt + Send + Sync + 'static,
{
    async fn map(&self, obj: &K, _state: &Arc<State>) -> Vec<Request> {
        vec![Request::from_resource(obj)]
    }
}

// -----------------------------------------------------------------------------
// Controller structure

pub struct Controller<R>
where
    R: Reconcile,
{
    reconciler: Arc<R>,
    state: Arc<State>,
    queue: Arc<Queue<Request>>,
    limiter: Arc<RateLimiter<Request>>,
    workers: usize,
    watchers: Vec<JoinHandle<()>>,
}

impl<R> Controller<R>
where
    R: Reconcile,
    <R::Resource as Resource>::DynamicType: Default,
{
    pub fn new(reconciler: R, state: Arc<State>, workers: usize) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            state,
            queue: Arc::new(Queue::new()),
            limiter: Arc::new(RateLimiter::default()),
            workers,
            watchers: vec![],
        }
    }

    /// handle to the controller's queue, other components may enqueue work
    /// directly
    pub fn queue(&self) -> Arc<Queue<Request>> {
        self.queue.to_owned()
    }

    /// register a watch source, events pass the mapper's fingerprint filter
    /// then fan out to requests on this controller's queue
    pub fn watch<K, M>(&mut self, api: Api<K>, config: watcher::Config, mapper: M) -> &mut Self
    where
        K: Resource + ResourceExt + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        <K as Resource>::DynamicType: Default + Eq + Hash + Clone,
        M: Mapper<K>,
    {
        let queue = self.queue.to_owned();
        let state = self.state.to_owned();

        self.watchers.push(tokio::spawn(async move {
            let mut fingerprints: HashMap<String, u64> = HashMap::new();
            let mut stream = watcher(api, config).boxed();

            loop {
                match stream.next().await {
                    None => break,
                    Some(Err(err)) => {
                        // the watcher recovers by itself, backoff happens there
                        warn!(error = err.to_string(), "Watch stream yielded an error");
                    }
                    Some(Ok(Event::Applied(obj))) => {
                        let key = cache_key(&obj);
                        if let Some(fingerprint) = mapper.fingerprint(&obj) {
                            if fingerprints.get(&key) == Some(&fingerprint) {
                                debug!(key = &key, "Filtered no-op update");
                                continue;
                            }

                            fingerprints.insert(key, fingerprint);
                        }

                        for request in mapper.map(&obj, &state).await {
                            queue.add(request);
                        }
                    }
                    Some(Ok(Event::Deleted(obj))) => {
                        fingerprints.remove(&cache_key(&obj));
                        for request in mapper.map(&obj, &state).await {
                            queue.add(request);
                        }
                    }
                    Some(Ok(Event::Restarted(objs))) => {
                        fingerprints.clear();
                        for obj in &objs {
                            if let Some(fingerprint) = mapper.fingerprint(obj) {
                                fingerprints.insert(cache_key(obj), fingerprint);
                            }

                            for request in mapper.map(obj, &state).await {
                                queue.add(request);
                            }
                        }
                    }
                }
            }
        }));

        self
    }

    /// start the worker pool, at most one reconcile per namespaced name runs
    /// at any instant thanks to the queue's in-flight de-duplication
    pub fn run(self) -> Handle {
        let mut workers = Vec::with_capacity(self.workers);

        info!(kind = R::KIND, workers = self.workers, "Start controller");
        for index in 0..self.workers {
            let queue = self.queue.to_owned();
            let limiter = self.limiter.to_owned();
            let reconciler = self.reconciler.to_owned();
            let state = self.state.to_owned();

            workers.push(tokio::spawn(async move {
                while let Some(request) = queue.get().await {
                    let outcome = process(reconciler.as_ref(), &state, &request).await;

                    match outcome {
                        Outcome::Done => limiter.forget(&request),
                        Outcome::RequeueAfter(delay) => {
                            debug!(
                                kind = R::KIND,
                                name = &request.name,
                                delay = delay.as_millis() as u64,
                                "Requeue resource with explicit delay"
                            );

                            queue.add_after(request.to_owned(), delay);
                        }
                        Outcome::Requeue => {
                            let delay = limiter.when(&request);
                            debug!(
                                kind = R::KIND,
                                name = &request.name,
                                delay = delay.as_millis() as u64,
                                retries = limiter.retries(&request),
                                "Requeue resource under rate limiter"
                            );

                            queue.add_after(request.to_owned(), delay);
                        }
                    }

                    queue.done(&request);
                }

                debug!(kind = R::KIND, worker = index, "Worker drained, exiting");
            }));
        }

        Handle {
            queue: self.queue,
            watchers: self.watchers,
            workers,
        }
    }
}

// -----------------------------------------------------------------------------
// Handle structure

/// running controller, shutting down closes the queue so workers drain
/// in-flight items then exit
pub struct Handle {
    pub queue: Arc<Queue<Request>>,
    watchers: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Handle {
    pub fn shutdown(&self) {
        for watcher in &self.watchers {
            watcher.abort();
        }

        self.queue.shut_down();
    }

    pub async fn join(self) {
        for worker in self.workers {
            if let Err(err) = worker.await {
                if !err.is_cancelled() {
                    warn!(error = err.to_string(), "Could not wait for the worker to complete");
                }
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Helper functions

fn cache_key<K>(obj: &K) -> String
where
    K: ResourceExt,
{
    match obj.namespace() {
        Some(namespace) => format!("{namespace}/{}", obj.name_any()),
        None => obj.name_any(),
    }
}

/// fingerprint helper for mappers filtering on a deep-equal basis
pub fn fingerprint<T>(value: &T) -> u64
where
    T: Hash,
{
    use std::hash::Hasher;

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
