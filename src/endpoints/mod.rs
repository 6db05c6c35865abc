//! Endpoint Registry
//!
//! Maps a canonical request path to a JSON-producing [`Producer`]. Each
//! endpoint's document is serialized once and cached as [`Bytes`]; serving a
//! request clones the handle, never the text. Producers that change over
//! time declare a refresh interval and the event loop refreshes them from a
//! periodic timer, which also regenerates the aggregate `all` document.
//!
//! ```text
//!   "uname" ──► Uname  ──► cached {"sysname":...}
//!   "smver" ──► Smver  ──► cached {"major":...}
//!   "info"  ──► Info   ──► cached {"build_compiler":...}
//!   "cpu"   ──► Cpu    ──► cached {"numConfigured":...}   (refreshed)
//!   "all"   ──► every other endpoint under its own name
//! ```

pub mod cpu;
pub mod info;
pub mod smver;
pub mod uname;

pub use cpu::Cpu;
pub use info::Info;
pub use smver::Smver;
pub use uname::Uname;

use bytes::Bytes;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Name of the aggregate endpoint.
pub const ALL_ENDPOINT: &str = "all";

/// A source of one JSON document.
pub trait Producer: Send {
    /// Endpoint name, which is also the request path.
    fn name(&self) -> &'static str;

    /// Writes this producer's fields into `out`.
    fn emit(&self, out: &mut Map<String, Value>);

    /// Re-reads whatever the document is built from.
    fn refresh(&mut self) {}

    /// How often [`Producer::refresh`] should run, if ever.
    fn refresh_interval(&self) -> Option<Duration> {
        None
    }
}

struct Endpoint {
    producer: Box<dyn Producer>,
    cached: Option<Bytes>,
}

/// What a path resolves to.
pub enum Handler<'a> {
    Single {
        producer: &'a dyn Producer,
        cached: Option<&'a Bytes>,
    },
    All(&'a Registry),
}

impl Handler<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Handler::Single { producer, .. } => producer.name(),
            Handler::All(_) => ALL_ENDPOINT,
        }
    }

    /// Builds the handler's document into `out`.
    pub fn emit(&self, out: &mut Map<String, Value>) {
        match self {
            Handler::Single { producer, .. } => producer.emit(out),
            Handler::All(registry) => registry.emit_all(out),
        }
    }

    /// The serialized document as of the last refresh, or `None` when it
    /// could not be produced.
    pub fn body(&self) -> Option<Bytes> {
        match self {
            Handler::Single { cached, .. } => cached.cloned(),
            Handler::All(registry) => registry.all_cached.clone(),
        }
    }
}

fn stringify(handler: &Handler<'_>) -> Option<Bytes> {
    let mut doc = Map::new();
    handler.emit(&mut doc);
    match serde_json::to_vec(&Value::Object(doc)) {
        Ok(body) => Some(Bytes::from(body)),
        Err(e) => {
            warn!(endpoint = handler.name(), error = %e, "failed to serialize endpoint");
            None
        }
    }
}

fn uncached(producer: &dyn Producer) -> Handler<'_> {
    Handler::Single {
        producer,
        cached: None,
    }
}

/// The set of served endpoints.
#[derive(Default)]
pub struct Registry {
    endpoints: Vec<Endpoint>,
    all_cached: Option<Bytes>,
}

impl Registry {
    /// An empty registry. The `all` endpoint always exists.
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.regenerate_all();
        registry
    }

    /// A registry with the standard host endpoints.
    pub fn with_defaults() -> Self {
        Self::standard(cpu::DEFAULT_REFRESH)
    }

    /// The standard host endpoints, refreshing `cpu` every `cpu_refresh`.
    pub fn standard(cpu_refresh: Duration) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(Uname::new()));
        registry.register(Box::new(Smver::from_crate()));
        registry.register(Box::new(Info::new()));
        registry.register(Box::new(Cpu::with_refresh(cpu_refresh)));
        registry
    }

    /// Adds a producer and returns its index. A producer with a name that is
    /// already registered replaces the existing one.
    pub fn register(&mut self, producer: Box<dyn Producer>) -> usize {
        let name = producer.name();
        let cached = stringify(&uncached(producer.as_ref()));
        let endpoint = Endpoint { producer, cached };

        let index = match self.position(name) {
            Some(i) => {
                warn!(endpoint = name, "replacing registered endpoint");
                self.endpoints[i] = endpoint;
                i
            }
            None => {
                self.endpoints.push(endpoint);
                self.endpoints.len() - 1
            }
        };

        debug!(endpoint = name, index, "registered endpoint");
        self.regenerate_all();
        index
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.endpoints
            .iter()
            .position(|e| e.producer.name() == name)
    }

    /// Endpoint names in registration order, `all` last.
    pub fn names(&self) -> Vec<&'static str> {
        self.endpoints
            .iter()
            .map(|e| e.producer.name())
            .chain(std::iter::once(ALL_ENDPOINT))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Resolves a canonical path to its handler.
    pub fn find_handler(&self, path: &str) -> Option<Handler<'_>> {
        if path == ALL_ENDPOINT {
            return Some(Handler::All(self));
        }
        self.position(path).map(|i| {
            let endpoint = &self.endpoints[i];
            Handler::Single {
                producer: endpoint.producer.as_ref(),
                cached: endpoint.cached.as_ref(),
            }
        })
    }

    /// Cached body for `path`. `Some(None)` means the endpoint exists but
    /// its document could not be produced.
    pub fn body(&self, path: &str) -> Option<Option<Bytes>> {
        self.find_handler(path).map(|handler| handler.body())
    }

    fn emit_all(&self, out: &mut Map<String, Value>) {
        for endpoint in &self.endpoints {
            let mut doc = Map::new();
            endpoint.producer.emit(&mut doc);
            out.insert(endpoint.producer.name().to_string(), Value::Object(doc));
        }
    }

    fn regenerate_all(&mut self) {
        self.all_cached = stringify(&Handler::All(self));
    }

    /// Producers that want periodic refreshes, by index.
    pub fn refresh_schedule(&self) -> Vec<(usize, Duration)> {
        self.endpoints
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.producer.refresh_interval().map(|d| (i, d)))
            .collect()
    }

    /// Refreshes one producer and regenerates its cache and the aggregate.
    pub fn refresh(&mut self, index: usize) -> bool {
        let Some(endpoint) = self.endpoints.get_mut(index) else {
            return false;
        };
        endpoint.producer.refresh();
        endpoint.cached = stringify(&uncached(endpoint.producer.as_ref()));
        self.regenerate_all();
        true
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("endpoints", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Counter {
        value: u64,
    }

    impl Producer for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn emit(&self, out: &mut Map<String, Value>) {
            out.insert("value".into(), json!(self.value));
        }

        fn refresh(&mut self) {
            self.value += 1;
        }

        fn refresh_interval(&self) -> Option<Duration> {
            Some(Duration::from_secs(1))
        }
    }

    fn parse(body: Bytes) -> Value {
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn test_find_handler() {
        let registry = Registry::with_defaults();
        assert!(registry.find_handler("smver").is_some());
        assert!(registry.find_handler("cpu").is_some());
        assert!(registry.find_handler("all").is_some());
        assert!(registry.find_handler("nope").is_none());
        assert!(registry.find_handler(".").is_none());
    }

    #[test]
    fn test_handler_emit_matches_cache() {
        let registry = Registry::with_defaults();
        let handler = registry.find_handler("smver").unwrap();
        let mut doc = Map::new();
        handler.emit(&mut doc);

        let cached = parse(registry.body("smver").unwrap().unwrap());
        assert_eq!(Value::Object(doc), cached);
    }

    #[test]
    fn test_handler_serves_cache_until_refresh() {
        let mut registry = Registry::new();
        let idx = registry.register(Box::new(Counter { value: 0 }));

        let handler = registry.find_handler("counter").unwrap();
        assert_eq!(handler.name(), "counter");
        assert_eq!(parse(handler.body().unwrap()), json!({"value": 0}));

        registry.refresh(idx);
        let all = registry.find_handler("all").unwrap();
        assert_eq!(parse(all.body().unwrap()), json!({"counter": {"value": 1}}));
    }

    #[test]
    fn test_all_aggregates_every_other_endpoint() {
        let registry = Registry::with_defaults();
        let all = parse(registry.body("all").unwrap().unwrap());
        let obj = all.as_object().unwrap();

        let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["uname", "smver", "info", "cpu"]);
        assert!(!obj.contains_key("all"));
    }

    #[test]
    fn test_refresh_updates_cache_and_all() {
        let mut registry = Registry::new();
        let idx = registry.register(Box::new(Counter { value: 0 }));
        assert_eq!(registry.refresh_schedule(), vec![(idx, Duration::from_secs(1))]);

        assert!(registry.refresh(idx));
        assert_eq!(parse(registry.body("counter").unwrap().unwrap()), json!({"value": 1}));
        assert_eq!(
            parse(registry.body("all").unwrap().unwrap()),
            json!({"counter": {"value": 1}})
        );
        assert!(!registry.refresh(99));
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = Registry::new();
        let a = registry.register(Box::new(Counter { value: 1 }));
        let b = registry.register(Box::new(Counter { value: 5 }));
        assert_eq!(a, b);
        assert_eq!(registry.names(), vec!["counter", "all"]);
        assert_eq!(parse(registry.body("counter").unwrap().unwrap()), json!({"value": 5}));
    }

    #[test]
    fn test_empty_registry_all() {
        let registry = Registry::new();
        assert_eq!(parse(registry.body("all").unwrap().unwrap()), json!({}));
    }
}
