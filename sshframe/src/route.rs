// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A pattern-matching dispatch tree: a request carrying a path like
//! `"session/pty-req"` walks down a chain of `Route`s, each validating one
//! `/`-separated segment against either a literal or a `{name:regex}`
//! pattern, and is delivered to the matching node's subscribers (or its
//! invalid sink on a mismatch).

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock as StdRwLock,
    },
    time::Duration,
};

use futures::future::BoxFuture;
use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::RwLock;

use crate::payload_rack::PayloadRack;

lazy_static! {
    /// Matches a `{name:regex}` parameterized segment; anything else is a
    /// literal segment compared with `==`.
    static ref SEGMENT_PATTERN: Regex = Regex::new(r"^\{([^:}]+):(.+)\}$").unwrap();
}

fn split_path(path: &str) -> Vec<String> {
    path.trim_start_matches('/').split('/').map(str::to_string).collect()
}

#[derive(Debug)]
enum Pattern {
    Literal(String),
    Named { name: String, regex: Regex },
}

impl Pattern {
    fn parse(segment: &str) -> Self {
        match SEGMENT_PATTERN.captures(segment) {
            Some(caps) => {
                let name = caps[1].to_string();
                let regex = Regex::new(&format!("^{}$", &caps[2]))
                    .unwrap_or_else(|e| panic!("invalid route pattern {segment:?}: {e}"));
                Pattern::Named { name, regex }
            }
            None => Pattern::Literal(segment.to_string()),
        }
    }

    /// The key a route is stored under in a parent's children map, or in a
    /// `RouteMaker`: the literal itself, or a parameterized segment's name.
    fn segment_id(&self) -> &str {
        match self {
            Pattern::Literal(s) => s,
            Pattern::Named { name, .. } => name,
        }
    }

    /// `Some(matched literal)` on success, `None` on mismatch.
    fn validate(&self, segment: &str) -> Option<String> {
        match self {
            Pattern::Literal(s) if s == segment => Some(s.clone()),
            Pattern::Literal(_) => None,
            Pattern::Named { regex, .. } if regex.is_match(segment) => Some(segment.to_string()),
            Pattern::Named { .. } => None,
        }
    }
}

/// A one-shot completion notifier with ordered subscribers, fulfilled at
/// most once when a payload rack's timer wins the race against `release`.
/// Replaces the source's `flux.ActionInterface` per spec §9's redesign
/// note: a plain ordered-subscriber list invoked on fulfillment.
pub struct FailAction<P> {
    subscribers: Mutex<Vec<Arc<dyn Fn(P) + Send + Sync>>>,
}

impl<P: Clone> FailAction<P> {
    pub fn new() -> Arc<Self> {
        Arc::new(FailAction { subscribers: Mutex::new(Vec::new()) })
    }

    pub fn subscribe(&self, f: impl Fn(P) + Send + Sync + 'static) {
        self.subscribers.lock().expect("fail action lock poisoned").push(Arc::new(f));
    }

    pub fn fulfill(&self, payload: P) {
        for sub in self.subscribers.lock().expect("fail action lock poisoned").iter() {
            sub(payload.clone());
        }
    }
}

pub type FailCtor<P> = Arc<dyn Fn() -> Arc<FailAction<P>> + Send + Sync>;

/// The payload a request carries: raw until a route with a failure
/// constructor wraps it into a time-bounded rack (spec §4.2's "payload
/// wrapping policy").
#[derive(Clone)]
pub enum Payload<P> {
    Raw(P),
    Racked(Arc<PayloadRack<P>>),
}

/// A dispatch envelope. `paths` is the ordered remainder of route segments
/// still to be validated; each hop that matches strips its leading segment
/// before forwarding to children.
#[derive(Clone)]
pub struct Request<P> {
    pub paths: Vec<String>,
    pub payload: Payload<P>,
    pub param: Option<String>,
    /// Milliseconds. `0` means "use the route's default", negative means
    /// "resolve immediately, don't wrap in a timed rack."
    pub timeout: i64,
}

impl<P> Request<P> {
    pub fn new(path: &str, payload: P, timeout: i64) -> Self {
        Request { paths: split_path(path), payload: Payload::Raw(payload), param: None, timeout }
    }

    /// Strips the leading path segment, as each successfully matched hop
    /// does before forwarding to its children.
    fn strip_leading(&self) -> Self
    where
        P: Clone,
    {
        let paths = if self.paths.len() <= 1 { self.paths.clone() } else { self.paths[1..].to_vec() };
        Request { paths, payload: self.payload.clone(), param: None, timeout: self.timeout }
    }
}

type SubscriberFn<P> = Arc<dyn Fn(Arc<Request<P>>) -> BoxFuture<'static, ()> + Send + Sync>;

struct SubscriberList<P> {
    next_id: AtomicU64,
    entries: Mutex<IndexMap<u64, SubscriberFn<P>>>,
}

impl<P> SubscriberList<P> {
    fn new() -> Self {
        SubscriberList { next_id: AtomicU64::new(0), entries: Mutex::new(IndexMap::new()) }
    }

    fn push(self: &Arc<Self>, f: SubscriberFn<P>) -> Subscription<P> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().expect("subscriber list lock poisoned").insert(id, f);
        Subscription { list: Arc::clone(self), id }
    }

    fn snapshot(&self) -> Vec<SubscriberFn<P>> {
        self.entries.lock().expect("subscriber list lock poisoned").values().cloned().collect()
    }
}

/// A handle returned from `sub`/`not_sub`/`all_sub`. Dropping it does
/// nothing; call `close()` to unsubscribe.
pub struct Subscription<P> {
    list: Arc<SubscriberList<P>>,
    id: u64,
}

impl<P> Subscription<P> {
    pub fn close(self) {
        self.list.entries.lock().expect("subscriber list lock poisoned").shift_remove(&self.id);
    }
}

/// A node in the dispatch tree.
pub struct Route<P> {
    pub path: String,
    pattern: Pattern,
    all: Arc<SubscriberList<P>>,
    valid: Arc<SubscriberList<P>>,
    invalid: Arc<SubscriberList<P>>,
    children: RwLock<IndexMap<String, Arc<Route<P>>>>,
    default_timeout_ms: i64,
    fail_ctor: StdRwLock<Option<FailCtor<P>>>,
}

impl<P: Clone + Send + Sync + 'static> Route<P> {
    /// `NewRoute`/`RawRoute`: a fresh root-shaped route, no parent.
    pub fn new(path: &str, default_timeout_ms: i64, fail_ctor: Option<FailCtor<P>>) -> Arc<Self> {
        Arc::new(Route {
            path: path.to_string(),
            pattern: Pattern::parse(path),
            all: Arc::new(SubscriberList::new()),
            valid: Arc::new(SubscriberList::new()),
            invalid: Arc::new(SubscriberList::new()),
            children: RwLock::new(IndexMap::new()),
            default_timeout_ms,
            fail_ctor: StdRwLock::new(fail_ctor),
        })
    }

    /// `FromRoute`: attaches a child under `parent`, keyed by the child
    /// pattern's segment identifier, inheriting the parent's default
    /// timeout and failure constructor.
    pub async fn from_route(parent: &Arc<Self>, path: &str) -> Arc<Self> {
        let fail_ctor = parent.fail_ctor.read().expect("fail ctor lock poisoned").clone();
        let child = Route::new(path, parent.default_timeout_ms, fail_ctor);
        parent
            .children
            .write()
            .await
            .insert(child.pattern.segment_id().to_string(), Arc::clone(&child));
        child
    }

    /// `InvertRoute`: a route that validates the same, unconsumed request
    /// that its parent rejected, rather than a stripped continuation of a
    /// request the parent accepted.
    pub fn invert_route(parent: &Arc<Self>, path: &str, fail_ctor: Option<FailCtor<P>>) -> Arc<Self> {
        let fail_ctor =
            fail_ctor.or_else(|| parent.fail_ctor.read().expect("fail ctor lock poisoned").clone());
        let inverted = Route::new(path, parent.default_timeout_ms, fail_ctor);
        let target = Arc::clone(&inverted);
        parent.not_sub(move |req| {
            let target = Arc::clone(&target);
            Box::pin(async move {
                target.serve_request((*req).clone()).await;
            })
        });
        inverted
    }

    /// `PatchRoute`: ensures this route can wrap payloads in racks,
    /// installing a default failure constructor if none is set yet, and
    /// returning the constructor either way.
    pub fn patch_route(self: &Arc<Self>) -> FailCtor<P> {
        {
            let existing = self.fail_ctor.read().expect("fail ctor lock poisoned");
            if let Some(ctor) = existing.as_ref() {
                return Arc::clone(ctor);
            }
        }
        let ctor: FailCtor<P> = Arc::new(|| FailAction::new());
        *self.fail_ctor.write().expect("fail ctor lock poisoned") = Some(Arc::clone(&ctor));
        ctor
    }

    pub fn sub<F, Fut>(&self, f: F) -> Subscription<P>
    where
        F: Fn(Arc<Request<P>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.valid.push(Arc::new(move |req| Box::pin(f(req)) as BoxFuture<'static, ()>))
    }

    pub fn not_sub<F, Fut>(&self, f: F) -> Subscription<P>
    where
        F: Fn(Arc<Request<P>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.invalid.push(Arc::new(move |req| Box::pin(f(req)) as BoxFuture<'static, ()>))
    }

    pub fn all_sub<F, Fut>(&self, f: F) -> Subscription<P>
    where
        F: Fn(Arc<Request<P>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.all.push(Arc::new(move |req| Box::pin(f(req)) as BoxFuture<'static, ()>))
    }

    /// `Serve`: builds a request and dispatches it, unless `path` is empty
    /// or the bare separator.
    pub async fn serve(self: &Arc<Self>, path: &str, payload: P, timeout: i64) {
        if path.is_empty() || path == "/" {
            return;
        }
        self.serve_request(Request::new(path, payload, timeout)).await;
    }

    /// `ServeRequest`: validates the request's leading segment against
    /// this route's pattern, firing valid or invalid subscribers and
    /// fanning a stripped continuation out to children on a match.
    pub fn serve_request(self: &Arc<Self>, req: Request<P>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            for sub in self.all.snapshot() {
                sub(Arc::new(req.clone())).await;
            }

            let req = self.wrap_if_needed(req);

            let Some(segment) = req.paths.first().cloned() else { return };

            match self.pattern.validate(&segment) {
                Some(param) => {
                    let mut matched = req.clone();
                    matched.param = Some(param);

                    for sub in self.valid.snapshot() {
                        sub(Arc::new(matched.clone())).await;
                    }

                    let children: Vec<_> = self.children.read().await.values().cloned().collect();
                    if !children.is_empty() {
                        let forwarded = matched.strip_leading();
                        for child in children {
                            child.serve_request(forwarded.clone()).await;
                        }
                    }
                }
                None => {
                    for sub in self.invalid.snapshot() {
                        sub(Arc::new(req.clone())).await;
                    }
                }
            }
        })
    }

    fn wrap_if_needed(&self, req: Request<P>) -> Request<P> {
        let ctor = match self.fail_ctor.read().expect("fail ctor lock poisoned").clone() {
            Some(ctor) => ctor,
            None => return req,
        };
        match req.payload {
            Payload::Racked(_) => req,
            Payload::Raw(raw) => {
                let effective_ms = if req.timeout != 0 { req.timeout } else { self.default_timeout_ms };
                let timeout = if effective_ms < 0 { None } else { Some(Duration::from_millis(effective_ms as u64)) };
                let rack = Arc::new(PayloadRack::new(timeout));
                let fail_action = ctor();
                rack.load(raw, move |payload| fail_action.fulfill(payload));
                Request { paths: req.paths, payload: Payload::Racked(rack), param: req.param, timeout: req.timeout }
            }
        }
    }
}

/// Maps route ids (a dotted/slashed path as originally given to
/// `new_chain`, or a pattern's segment identifier) to the `Route` built
/// for it. Bookkeeping only; dispatch itself happens through the tree of
/// `children`, not through this map.
pub struct RouteMaker<P> {
    routes: StdRwLock<HashMap<String, Arc<Route<P>>>>,
}

impl<P: Clone + Send + Sync + 'static> RouteMaker<P> {
    /// `NewRouteMaker`: builds a straight-line chain of routes, one per
    /// `/`-separated segment of `chain`, each a child of the previous.
    pub async fn new_chain(chain: &str, default_timeout_ms: i64, fail_ctor: Option<FailCtor<P>>) -> Self {
        let mut routes = HashMap::new();
        let mut last: Option<Arc<Route<P>>> = None;
        for segment in split_path(chain) {
            let next = match &last {
                None => Route::new(&segment, default_timeout_ms, fail_ctor.clone()),
                Some(parent) => Route::from_route(parent, &segment).await,
            };
            routes.insert(next.path.clone(), Arc::clone(&next));
            last = Some(next);
        }
        RouteMaker { routes: StdRwLock::new(routes) }
    }

    /// `RootRouteMaker`: seeds the map with a single pre-built root route,
    /// so callers like `Protocol::new` don't special-case the service-root
    /// route differently from a chain built with `new_chain`.
    pub fn root(root: Arc<Route<P>>) -> Self {
        let mut routes = HashMap::new();
        routes.insert("/".to_string(), root);
        RouteMaker { routes: StdRwLock::new(routes) }
    }

    pub fn route(&self, id: &str) -> Option<Arc<Route<P>>> {
        self.routes.read().expect("route maker lock poisoned").get(id).cloned()
    }

    /// `Combine`: grafts `child_pattern` onto the route stored under
    /// `parent_id`, skipping silently if the parent is unknown or a route
    /// is already registered under the child's segment id — the original
    /// Go implementation's "don't clobber an existing route" guard.
    pub async fn combine(&self, parent_id: &str, child_pattern: &str) {
        let Some(parent) = self.route(parent_id) else { return };
        let id = Pattern::parse(child_pattern).segment_id().to_string();
        if self.routes.read().expect("route maker lock poisoned").contains_key(&id) {
            return;
        }
        let child = Route::from_route(&parent, child_pattern).await;
        self.routes.write().expect("route maker lock poisoned").insert(id, child);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;
    use std::sync::Mutex as StdMutex;

    fn collector() -> (Arc<StdMutex<Vec<String>>>, impl Fn(Arc<Request<String>>) -> BoxFuture<'static, ()>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        let cb = move |req: Arc<Request<String>>| {
            let captured = Arc::clone(&captured);
            Box::pin(async move {
                if let Payload::Raw(p) = &req.payload {
                    captured.lock().unwrap().push(p.clone());
                }
            }) as BoxFuture<'static, ()>
        };
        (seen, cb)
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn s1_route_dispatch() {
        let route = Route::<String>::new("apple", 0, None);
        let (seen, cb) = collector();
        route.sub(cb);
        let (invalid_seen, invalid_cb) = collector();
        route.not_sub(invalid_cb);

        route.serve("apple", "red!".to_string(), 0).await;

        assert_eq!(seen.lock().unwrap().as_slice(), ["red!".to_string()]);
        assert!(invalid_seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn s2_payload_rack_success() {
        let route = Route::<String>::new("apple", 3, Some(Arc::new(|| FailAction::new())));
        let released = Arc::new(StdMutex::new(None));
        let failed = Arc::new(StdMutex::new(false));

        let released_clone = Arc::clone(&released);
        let failed_clone = Arc::clone(&failed);
        route.sub(move |req| {
            let released_clone = Arc::clone(&released_clone);
            let failed_clone = Arc::clone(&failed_clone);
            Box::pin(async move {
                if let Payload::Racked(rack) = &req.payload {
                    if let Some(v) = rack.release().await {
                        *released_clone.lock().unwrap() = Some(v);
                    } else {
                        *failed_clone.lock().unwrap() = true;
                    }
                }
            })
        });

        route.serve("apple", "red".to_string(), 2).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(*released.lock().unwrap(), Some("red".to_string()));
        assert!(!*failed.lock().unwrap());
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn s3_payload_rack_timeout_fires_fail_action() {
        let fail_seen = Arc::new(StdMutex::new(None));
        let fail_seen_clone = Arc::clone(&fail_seen);
        let fail_ctor: FailCtor<String> = Arc::new(move || {
            let action = FailAction::new();
            let fail_seen_clone = Arc::clone(&fail_seen_clone);
            action.subscribe(move |payload| {
                *fail_seen_clone.lock().unwrap() = Some(payload);
            });
            action
        });

        let route = Route::<String>::new("apple", 2, Some(fail_ctor));
        // Subscriber that deliberately never releases the rack.
        route.sub(|_req| Box::pin(async move {}));

        route.serve("apple", "red".to_string(), 0).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*fail_seen.lock().unwrap(), Some("red".to_string()));
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn s4_child_route() {
        let root = Route::<String>::new("apple", 0, None);
        let child = Route::from_route(&root, r"{id:\d+}").await;

        let (valid_seen, valid_cb) = collector();
        child.sub(valid_cb);
        let (invalid_seen, invalid_cb) = collector();
        child.not_sub(invalid_cb);

        root.serve("apple/20", "fruits!".to_string(), 0).await;
        assert_eq!(valid_seen.lock().unwrap().as_slice(), ["fruits!".to_string()]);
        assert!(invalid_seen.lock().unwrap().is_empty());

        root.serve("apple/abc", "fruits!".to_string(), 0).await;
        assert_eq!(invalid_seen.lock().unwrap().as_slice(), ["fruits!".to_string()]);
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn s5_invert_route() {
        let root = Route::<String>::new("apple", 0, None);
        let inverted = Route::invert_route(&root, r"{id:\d+}", None);

        let (seen, cb) = collector();
        inverted.sub(cb);

        // "20" doesn't match the literal "apple" pattern, so it lands on
        // root's invalid sink, which the inverted route re-validates.
        root.serve("20", "fruits!".to_string(), 0).await;

        assert_eq!(seen.lock().unwrap().as_slice(), ["fruits!".to_string()]);
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn route_maker_combine_skips_existing() {
        let maker = RouteMaker::<String>::new_chain("service", 0, None).await;
        maker.combine("service", "session").await;
        assert!(maker.route("session").is_some());

        // Calling combine again with the same id is a no-op, not a replace.
        let first = maker.route("session").unwrap();
        maker.combine("service", "session").await;
        let second = maker.route("session").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
