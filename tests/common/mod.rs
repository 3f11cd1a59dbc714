// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared test harness: a scripted mock fetcher, an event recorder, and
//! manager wiring with fast retry/backoff settings.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};

use offline_data_manager::{
    Event, FetchError, FetchRequest, Fetcher, HttpMethod, HttpResponse, ManagerConfig,
    OfflineDataManager, StorageProbe, Store, Topic,
};

pub const ALL_TOPICS: [Topic; 10] = [
    Topic::Registered,
    Topic::Status,
    Topic::Progress,
    Topic::Complete,
    Topic::Expired,
    Topic::Error,
    Topic::Deferred,
    Topic::Deleted,
    Topic::Stopped,
    Topic::Connectivity,
];

/// Scripted behavior for one URL.
#[derive(Clone)]
pub struct Route {
    pub data: Vec<u8>,
    pub mime: Option<String>,
    pub supports_range: bool,
    pub content_encoding: Option<String>,
    pub head_fails: bool,
    /// Force this status on every GET (e.g. 500).
    pub get_status: Option<u16>,
    /// Answer Range GETs with 200 and the full body, like a server that
    /// ignores the Range header.
    pub ignore_range: bool,
}

impl Route {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            mime: Some("application/octet-stream".to_string()),
            supports_range: false,
            content_encoding: None,
            head_fails: false,
            get_status: None,
            ignore_range: false,
        }
    }

    pub fn with_mime(mut self, mime: &str) -> Self {
        self.mime = Some(mime.to_string());
        self
    }

    pub fn ranged(mut self) -> Self {
        self.supports_range = true;
        self
    }

    pub fn encoded(mut self, encoding: &str) -> Self {
        self.content_encoding = Some(encoding.to_string());
        self
    }

    pub fn head_failing(mut self) -> Self {
        self.head_fails = true;
        self
    }

    pub fn always_status(mut self, status: u16) -> Self {
        self.get_status = Some(status);
        self
    }

    pub fn ignoring_range(mut self) -> Self {
        self.ignore_range = true;
        self
    }
}

/// One-shot block at the Nth request (1-based, HEAD included) to a route,
/// letting a test hold a transfer mid-flight deterministically.
pub struct Gate {
    at_request: u64,
    consumed: AtomicBool,
    entered_tx: watch::Sender<bool>,
    release: Notify,
}

impl Gate {
    pub fn at(at_request: u64) -> Arc<Self> {
        let (entered_tx, _) = watch::channel(false);
        Arc::new(Self {
            at_request,
            consumed: AtomicBool::new(false),
            entered_tx,
            release: Notify::new(),
        })
    }

    /// Wait until the gated request has arrived and is blocked.
    pub async fn entered(&self) {
        let mut rx = self.entered_tx.subscribe();
        rx.wait_for(|entered| *entered).await.expect("gate sender dropped");
    }

    /// Let the blocked request proceed.
    pub fn release(&self) {
        self.release.notify_one();
    }

    async fn maybe_block(&self, request_index: u64) {
        if request_index == self.at_request && !self.consumed.swap(true, Ordering::SeqCst) {
            self.entered_tx.send_replace(true);
            // Dropped here if the transfer is cancelled while blocked.
            self.release.notified().await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub method: HttpMethod,
    pub range: Option<(u64, u64)>,
}

struct RouteState {
    route: Route,
    gate: Option<Arc<Gate>>,
    requests: u64,
}

/// In-memory fetcher serving scripted routes keyed by URL.
#[derive(Default)]
pub struct MockFetcher {
    routes: Mutex<HashMap<String, RouteState>>,
    log: Mutex<Vec<RecordedRequest>>,
}

impl MockFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_route(&self, url: &str, route: Route) {
        let mut routes = self.routes.lock().unwrap();
        let state = routes.entry(url.to_string()).or_insert_with(|| RouteState {
            route: route.clone(),
            gate: None,
            requests: 0,
        });
        state.route = route;
    }

    pub fn set_gate(&self, url: &str, gate: Arc<Gate>) {
        let mut routes = self.routes.lock().unwrap();
        if let Some(state) = routes.get_mut(url) {
            state.gate = Some(gate);
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.log.lock().unwrap().clone()
    }

    pub fn range_requests(&self, url: &str) -> Vec<(u64, u64)> {
        self.requests()
            .into_iter()
            .filter(|r| r.url == url && r.method == HttpMethod::Get)
            .filter_map(|r| r.range)
            .collect()
    }

    pub fn get_count(&self, url: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.url == url && r.method == HttpMethod::Get)
            .count()
    }

    pub fn head_count(&self, url: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.url == url && r.method == HttpMethod::Head)
            .count()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<HttpResponse, FetchError> {
        let (route, gate, index) = {
            let mut routes = self.routes.lock().unwrap();
            let state = routes
                .get_mut(&request.url)
                .ok_or_else(|| FetchError::Network(format!("no route for {}", request.url)))?;
            state.requests += 1;
            (state.route.clone(), state.gate.clone(), state.requests)
        };

        if let Some(gate) = gate {
            gate.maybe_block(index).await;
        }

        // Logged after the gate so a cancelled-while-blocked request never
        // counts as served.
        self.log.lock().unwrap().push(RecordedRequest {
            url: request.url.clone(),
            method: request.method,
            range: request.range,
        });

        let mut headers: HashMap<String, String> = HashMap::new();
        if let Some(mime) = &route.mime {
            headers.insert("content-type".into(), mime.clone());
        }
        if let Some(encoding) = &route.content_encoding {
            headers.insert("content-encoding".into(), encoding.clone());
        }

        match request.method {
            HttpMethod::Head => {
                if route.head_fails {
                    return Err(FetchError::Network("HEAD refused".into()));
                }
                if route.supports_range {
                    headers.insert("accept-ranges".into(), "bytes".into());
                }
                headers.insert("content-length".into(), route.data.len().to_string());
                Ok(HttpResponse::without_body(200, headers))
            }
            HttpMethod::Get => {
                if let Some(status) = route.get_status {
                    return Ok(HttpResponse::from_bytes(status, headers, b"error".to_vec()));
                }
                match request.range {
                    Some((start, end)) if route.supports_range && !route.ignore_range => {
                        let len = route.data.len() as u64;
                        if start >= len {
                            return Ok(HttpResponse::from_bytes(416, headers, Vec::new()));
                        }
                        let end = end.min(len - 1);
                        let slice = route.data[start as usize..=end as usize].to_vec();
                        Ok(HttpResponse::from_bytes(206, headers, slice))
                    }
                    _ => {
                        headers.insert("content-length".into(), route.data.len().to_string());
                        Ok(HttpResponse::from_bytes(200, headers, route.data.clone()))
                    }
                }
            }
        }
    }
}

/// Records every emitted event in order and supports awaiting a predicate.
#[derive(Clone)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
    notify: Arc<Notify>,
}

impl EventLog {
    pub fn attach(manager: &OfflineDataManager) -> Self {
        let log = Self {
            events: Arc::new(Mutex::new(Vec::new())),
            notify: Arc::new(Notify::new()),
        };
        for topic in ALL_TOPICS {
            let events = Arc::clone(&log.events);
            let notify = Arc::clone(&log.notify);
            manager.on(topic, move |event| {
                events.lock().unwrap().push(event.clone());
                notify.notify_waiters();
            });
        }
        log
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn count_matching(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.snapshot().iter().filter(|e| predicate(e)).count()
    }

    /// Wait (up to 5s) until some recorded event matches.
    pub async fn wait_for(&self, predicate: impl Fn(&Event) -> bool) -> Event {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let waiter = self.notify.notified();
            if let Some(event) = self.snapshot().into_iter().find(|e| predicate(e)) {
                return event;
            }
            if tokio::time::timeout_at(deadline, waiter).await.is_err() {
                panic!(
                    "timed out waiting for event; recorded so far: {:#?}",
                    self.snapshot()
                );
            }
        }
    }
}

/// Config with millisecond backoff so retry tests run quickly.
pub fn fast_config() -> ManagerConfig {
    ManagerConfig {
        retry_backoff: Duration::from_millis(2),
        ..ManagerConfig::default()
    }
}

/// Manager wired with the given collaborators, defaulting the probe.
pub fn build_manager(
    store: Arc<dyn Store>,
    fetcher: Arc<MockFetcher>,
    probe: Option<Arc<dyn StorageProbe>>,
    config: ManagerConfig,
) -> OfflineDataManager {
    let mut builder = OfflineDataManager::builder()
        .config(config)
        .store(store)
        .fetcher(fetcher);
    if let Some(probe) = probe {
        builder = builder.probe(probe);
    }
    builder.build().expect("manager wiring failed")
}

/// Deterministic payload of the given size.
pub fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
