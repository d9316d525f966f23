//! Router facade
//!
//! The overlay consumes the service router through these traits: an
//! advert stream out, processed adverts in, and a queryable route table
//! for the prune cascade. [`MemoryRouter`] is the in-process
//! implementation used by local nodes and tests.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use std::collections::HashMap;

/// Capacity of the advert stream
const ADVERT_BACKLOG: usize = 128;

/// Router facade errors
#[derive(Debug, Error)]
pub enum RouterError {
    /// Route missing from the table; non-fatal for delete cascades
    #[error("route not found")]
    RouteNotFound,

    /// Route already present in the table
    #[error("duplicate route")]
    DuplicateRoute,

    /// No active advert stream to publish into
    #[error("advertising not started")]
    NotAdvertising,
}

/// A service route
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Service name
    pub service: String,
    /// Service node address
    pub address: String,
    /// Next-hop gateway address
    pub gateway: String,
    /// Network the route belongs to
    pub network: String,
    /// Id of the router that originated the route
    pub router: String,
    /// Link the route is reachable over
    pub link: String,
    /// Route cost; higher is worse
    pub metric: u64,
}

impl Route {
    fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.service, self.address, self.gateway, self.router
        )
    }
}

/// Route table query; `None` fields match anything
#[derive(Clone, Debug, Default)]
pub struct Query {
    /// Match the service name
    pub service: Option<String>,
    /// Match the gateway address
    pub gateway: Option<String>,
    /// Match the originating router id
    pub router: Option<String>,
    /// Match the network name
    pub network: Option<String>,
}

impl Query {
    fn matches(&self, route: &Route) -> bool {
        fn field(want: &Option<String>, got: &str) -> bool {
            want.as_deref().map(|w| w == got).unwrap_or(true)
        }
        field(&self.service, &route.service)
            && field(&self.gateway, &route.gateway)
            && field(&self.router, &route.router)
            && field(&self.network, &route.network)
    }
}

/// Kind of a route event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Route was created
    Create,
    /// Route was deleted
    Delete,
    /// Route was updated
    Update,
}

/// Kind of an advert batch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertType {
    /// Full table announcement
    Announce,
    /// Incremental update
    Update,
}

/// A single route change
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// What happened to the route
    pub kind: EventType,
    /// Unix nanoseconds when the event occurred
    pub timestamp: u64,
    /// The route affected
    pub route: Route,
}

/// A batch of route events flooded over the control channel
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Advert {
    /// Id of the advertising router
    pub id: String,
    /// Kind of batch
    pub kind: AdvertType,
    /// Unix nanoseconds when the advert was built
    pub timestamp: u64,
    /// Advert time-to-live in nanoseconds
    pub ttl: u64,
    /// The route events
    pub events: Vec<Event>,
}

/// Current time as unix nanoseconds
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Queryable route table
#[async_trait]
pub trait RouteTable: Send + Sync {
    /// Insert a route; duplicate routes are an error
    async fn create(&self, route: Route) -> Result<(), RouterError>;

    /// Insert or replace a route
    async fn update(&self, route: Route) -> Result<(), RouterError>;

    /// Remove a route
    async fn delete(&self, route: &Route) -> Result<(), RouterError>;

    /// Find routes matching a query
    async fn query(&self, query: &Query) -> Result<Vec<Route>, RouterError>;

    /// All routes
    async fn list(&self) -> Result<Vec<Route>, RouterError>;
}

/// The service router as consumed by the network overlay
#[async_trait]
pub trait Router: Send + Sync {
    /// Start the router
    async fn start(&self) -> Result<(), RouterError>;

    /// Stop the router
    async fn stop(&self) -> Result<(), RouterError>;

    /// Subscribe to the stream of adverts this router produces
    async fn advertise(&self) -> Result<mpsc::Receiver<Advert>, RouterError>;

    /// Apply an advert received from the network
    async fn process(&self, advert: Advert) -> Result<(), RouterError>;

    /// The router's route table
    fn table(&self) -> Arc<dyn RouteTable>;
}

/// In-memory route table
#[derive(Default)]
pub struct MemoryTable {
    routes: RwLock<HashMap<String, Route>>,
}

impl MemoryTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RouteTable for MemoryTable {
    async fn create(&self, route: Route) -> Result<(), RouterError> {
        let mut routes = self.routes.write().await;
        let key = route.key();
        if routes.contains_key(&key) {
            return Err(RouterError::DuplicateRoute);
        }
        routes.insert(key, route);
        Ok(())
    }

    async fn update(&self, route: Route) -> Result<(), RouterError> {
        self.routes.write().await.insert(route.key(), route);
        Ok(())
    }

    async fn delete(&self, route: &Route) -> Result<(), RouterError> {
        self.routes
            .write()
            .await
            .remove(&route.key())
            .map(|_| ())
            .ok_or(RouterError::RouteNotFound)
    }

    async fn query(&self, query: &Query) -> Result<Vec<Route>, RouterError> {
        let routes: Vec<Route> = self
            .routes
            .read()
            .await
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        if routes.is_empty() {
            return Err(RouterError::RouteNotFound);
        }
        Ok(routes)
    }

    async fn list(&self) -> Result<Vec<Route>, RouterError> {
        Ok(self.routes.read().await.values().cloned().collect())
    }
}

/// In-process router with an in-memory table
pub struct MemoryRouter {
    id: String,
    table: Arc<MemoryTable>,
    advert_tx: StdMutex<Option<mpsc::Sender<Advert>>>,
}

impl MemoryRouter {
    /// Create a router with the given id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            table: Arc::new(MemoryTable::new()),
            advert_tx: StdMutex::new(None),
        }
    }

    /// This router's id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Push an advert into the advertise stream
    pub async fn publish(&self, advert: Advert) -> Result<(), RouterError> {
        let tx = self
            .advert_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(RouterError::NotAdvertising)?;
        tx.send(advert)
            .await
            .map_err(|_| RouterError::NotAdvertising)
    }
}

#[async_trait]
impl Router for MemoryRouter {
    async fn start(&self) -> Result<(), RouterError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), RouterError> {
        self.advert_tx.lock().unwrap().take();
        Ok(())
    }

    async fn advertise(&self) -> Result<mpsc::Receiver<Advert>, RouterError> {
        let (tx, rx) = mpsc::channel(ADVERT_BACKLOG);
        *self.advert_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn process(&self, advert: Advert) -> Result<(), RouterError> {
        for event in advert.events {
            match event.kind {
                EventType::Create | EventType::Update => {
                    self.table.update(event.route).await?;
                }
                EventType::Delete => match self.table.delete(&event.route).await {
                    Ok(()) | Err(RouterError::RouteNotFound) => {}
                    Err(e) => return Err(e),
                },
            }
        }
        debug!("router {} processed advert", self.id);
        Ok(())
    }

    fn table(&self) -> Arc<dyn RouteTable> {
        self.table.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(service: &str, router: &str) -> Route {
        Route {
            service: service.to_string(),
            address: format!("{}:8080", service),
            gateway: "10.0.0.1:8085".to_string(),
            network: "overmesh".to_string(),
            router: router.to_string(),
            link: "network".to_string(),
            metric: 10,
        }
    }

    #[tokio::test]
    async fn test_table_query_by_router() {
        let table = MemoryTable::new();
        table.create(route("svc-a", "r1")).await.unwrap();
        table.create(route("svc-b", "r1")).await.unwrap();
        table.create(route("svc-c", "r2")).await.unwrap();

        let q = Query {
            router: Some("r1".to_string()),
            ..Default::default()
        };
        let found = table.query(&q).await.unwrap();
        assert_eq!(found.len(), 2);

        let q = Query {
            router: Some("absent".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            table.query(&q).await,
            Err(RouterError::RouteNotFound)
        ));
    }

    #[tokio::test]
    async fn test_table_delete_missing_is_not_found() {
        let table = MemoryTable::new();
        assert!(matches!(
            table.delete(&route("svc", "r1")).await,
            Err(RouterError::RouteNotFound)
        ));
    }

    #[tokio::test]
    async fn test_router_process_applies_events() {
        let router = MemoryRouter::new("r-local");
        let advert = Advert {
            id: "r1".to_string(),
            kind: AdvertType::Update,
            timestamp: now_nanos(),
            ttl: 0,
            events: vec![Event {
                kind: EventType::Create,
                timestamp: now_nanos(),
                route: route("svc-a", "r1"),
            }],
        };
        router.process(advert).await.unwrap();

        let routes = router.table().list().await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].service, "svc-a");
    }

    #[tokio::test]
    async fn test_publish_requires_advertise() {
        let router = MemoryRouter::new("r-local");
        let advert = Advert {
            id: "r-local".to_string(),
            kind: AdvertType::Update,
            timestamp: now_nanos(),
            ttl: 0,
            events: vec![],
        };
        assert!(matches!(
            router.publish(advert.clone()).await,
            Err(RouterError::NotAdvertising)
        ));

        let mut rx = router.advertise().await.unwrap();
        router.publish(advert).await.unwrap();
        assert!(rx.recv().await.is_some());
    }
}
