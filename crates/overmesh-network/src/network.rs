//! Network overlay
//!
//! Ties the tunnel channels together: membership gossip on `network`,
//! route adverts on `control`, plus the resolve, announce and prune
//! loops. One RwLock guards the neighbourhood graph; the router table is
//! internally synchronized by the router.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, trace};

use overmesh_tunnel::{Frame, Session, Tunnel, TunnelListener};

use crate::config::NetworkConfig;
use crate::error::NetworkResult;
use crate::node::{flatten, Node};
use crate::proto::{
    self, AdvertRecord, ClosePayload, ConnectPayload, NeighbourPayload, NodeRecord, RouteRecord,
};
use crate::resolver::Resolver;
use crate::router::{Advert, Event, Query, Route, Router, RouterError};
use crate::{CONTROL_CHANNEL, DEFAULT_LINK, MAX_METRIC, NETWORK_CHANNEL};

/// Capacity of the per-channel inbound message queues
const MSG_BACKLOG: usize = 128;

struct NetState {
    connected: bool,
    closed: watch::Sender<bool>,
    address: String,
    net_client: Option<Arc<Session>>,
}

impl Default for NetState {
    fn default() -> Self {
        Self {
            connected: false,
            closed: watch::channel(false).0,
            address: String::new(),
            net_client: None,
        }
    }
}

/// A node in the service mesh overlay
pub struct Network {
    id: String,
    config: NetworkConfig,
    tunnel: Arc<Tunnel>,
    router: Arc<dyn Router>,
    resolver: Arc<dyn Resolver>,
    neighbours: RwLock<HashMap<String, Node>>,
    state: Mutex<NetState>,
}

impl Network {
    /// Create a network node over the given tunnel. The network's seed
    /// nodes are pushed into the tunnel immediately.
    pub fn new(
        config: NetworkConfig,
        tunnel: Arc<Tunnel>,
        router: Arc<dyn Router>,
        resolver: Arc<dyn Resolver>,
    ) -> Arc<Self> {
        if !config.nodes.is_empty() {
            tunnel.init_nodes(config.nodes.clone());
        }

        Arc::new(Self {
            id: config.id.clone(),
            config,
            tunnel,
            router,
            resolver,
            neighbours: RwLock::new(HashMap::new()),
            state: Mutex::new(NetState::default()),
        })
    }

    /// This node's id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Network name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Bind address of the underlying tunnel
    pub async fn address(&self) -> String {
        self.tunnel.address().await
    }

    /// The underlying tunnel
    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    /// The service router this overlay feeds
    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    /// Every known node: self, neighbours and their reported
    /// neighbours, deduplicated
    pub async fn nodes(&self) -> Vec<Node> {
        let address = self.tunnel.address().await;
        let neighbours = self.neighbours.read().await;
        let root = Node {
            id: self.id.clone(),
            address,
            neighbours: neighbours.clone(),
            last_seen: None,
        };
        flatten(&root)
    }

    /// Resolver records merged with the configured seed nodes
    async fn resolve_nodes(&self) -> NetworkResult<Vec<String>> {
        let records = self.resolver.resolve(&self.config.name).await?;

        let mut seen = HashSet::new();
        let mut nodes = Vec::new();
        for record in records {
            if seen.insert(record.address.clone()) {
                nodes.push(record.address);
            }
        }
        for node in &self.config.nodes {
            if seen.insert(node.clone()) {
                nodes.push(node.clone());
            }
        }
        Ok(nodes)
    }

    /// Connect the overlay: bring up the tunnel, open both channels,
    /// start the router and the background loops. Idempotent.
    pub async fn connect(self: &Arc<Self>) -> NetworkResult<()> {
        let mut state = self.state.lock().await;
        if state.connected {
            return Ok(());
        }

        match self.resolve_nodes().await {
            Ok(nodes) if !nodes.is_empty() => self.tunnel.init_nodes(nodes),
            Ok(_) => {}
            Err(e) => debug!("failed to resolve {}: {}", self.config.name, e),
        }

        self.tunnel.connect().await?;
        let address = self.tunnel.address().await;

        let ctrl_client = Arc::new(self.tunnel.dial(CONTROL_CHANNEL).await?);
        let ctrl_listener = self.tunnel.listen(CONTROL_CHANNEL).await?;
        let net_client = Arc::new(self.tunnel.dial(NETWORK_CHANNEL).await?);
        let net_listener = self.tunnel.listen(NETWORK_CHANNEL).await?;

        // fresh shutdown signal for this connection epoch
        state.closed = watch::channel(false).0;
        let closed = state.closed.subscribe();

        self.router.start().await?;
        let advert_rx = self.router.advertise().await?;

        // introduce ourselves before the first announce tick
        let payload = ConnectPayload {
            node: self.node_record(&address),
        };
        match proto::encode(&payload) {
            Ok(body) => {
                let mut frame = Frame::with_body(body);
                frame.set_header(proto::HEADER_METHOD, proto::METHOD_CONNECT);
                if let Err(e) = net_client.send(frame).await {
                    debug!("failed to send connect message: {}", e);
                }
            }
            Err(e) => debug!("failed to marshal connect message: {}", e),
        }

        let net = Arc::clone(self);
        let c = closed.clone();
        tokio::spawn(async move { net.resolve_loop(c).await });

        let net = Arc::clone(self);
        let client = net_client.clone();
        let addr = address.clone();
        let c = closed.clone();
        tokio::spawn(async move { net.announce_loop(client, addr, c).await });

        let net = Arc::clone(self);
        let c = closed.clone();
        tokio::spawn(async move { net.prune_loop(c).await });

        let net = Arc::clone(self);
        let c = closed.clone();
        tokio::spawn(async move { net.process_net(net_listener, c).await });

        let net = Arc::clone(self);
        let c = closed.clone();
        tokio::spawn(async move { net.process_ctrl(ctrl_listener, c).await });

        let net = Arc::clone(self);
        let addr = address.clone();
        tokio::spawn(async move { net.advertise_loop(ctrl_client, advert_rx, addr, closed).await });

        state.address = address;
        state.net_client = Some(net_client);
        state.connected = true;
        Ok(())
    }

    /// Leave the network: say goodbye, stop the loops, stop the router,
    /// close the tunnel. Idempotent.
    pub async fn close(&self) -> NetworkResult<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Ok(());
        }
        state.connected = false;

        if let Some(net_client) = state.net_client.take() {
            let payload = ClosePayload {
                node: self.node_record(&state.address),
            };
            match proto::encode(&payload) {
                Ok(body) => {
                    let mut frame = Frame::with_body(body);
                    frame.set_header(proto::HEADER_METHOD, proto::METHOD_CLOSE);
                    if let Err(e) = net_client.send(frame).await {
                        debug!("failed to send close message: {}", e);
                    }
                }
                Err(e) => debug!("failed to marshal close message: {}", e),
            }
        }

        state.closed.send_replace(true);
        state.address.clear();

        self.router.stop().await?;
        self.tunnel.close().await?;
        Ok(())
    }

    fn node_record(&self, address: &str) -> NodeRecord {
        NodeRecord {
            id: self.id.clone(),
            address: address.to_string(),
        }
    }

    // ── background loops ─────────────────────────────────────────────

    /// Keep the tunnel seed set in sync with the resolver.
    async fn resolve_loop(self: Arc<Self>, mut closed: watch::Receiver<bool>) {
        let mut resolve = interval(self.config.resolve_interval);
        resolve.tick().await;

        loop {
            tokio::select! {
                _ = closed.changed() => return,
                _ = resolve.tick() => {
                    match self.resolve_nodes().await {
                        Ok(nodes) => self.tunnel.init_nodes(nodes),
                        Err(e) => debug!("failed to resolve {}: {}", self.config.name, e),
                    }
                }
            }
        }
    }

    /// Gossip our one-hop view on the network channel.
    async fn announce_loop(
        self: Arc<Self>,
        client: Arc<Session>,
        address: String,
        mut closed: watch::Receiver<bool>,
    ) {
        let mut announce = interval(self.config.announce_interval);

        loop {
            tokio::select! {
                _ = closed.changed() => return,
                _ = announce.tick() => self.announce_once(&client, &address).await,
            }
        }
    }

    async fn announce_once(&self, client: &Session, address: &str) {
        let neighbours: Vec<NodeRecord> = {
            let graph = self.neighbours.read().await;
            graph
                .values()
                .map(|n| NodeRecord {
                    id: n.id.clone(),
                    address: n.address.clone(),
                })
                .collect()
        };

        let payload = NeighbourPayload {
            node: self.node_record(address),
            neighbours,
        };
        let body = match proto::encode(&payload) {
            Ok(body) => body,
            Err(e) => {
                debug!("failed to marshal neighbour message: {}", e);
                return;
            }
        };

        let mut frame = Frame::with_body(body);
        frame.set_header(proto::HEADER_METHOD, proto::METHOD_NEIGHBOUR);
        if let Err(e) = client.send(frame).await {
            debug!("failed to send neighbour message: {}", e);
        }
    }

    /// Evict neighbours that have stopped announcing.
    async fn prune_loop(self: Arc<Self>, mut closed: watch::Receiver<bool>) {
        let mut prune = interval(self.config.prune_interval);
        prune.tick().await;

        loop {
            tokio::select! {
                _ = closed.changed() => return,
                _ = prune.tick() => self.prune_once().await,
            }
        }
    }

    async fn prune_once(&self) {
        let mut neighbours = self.neighbours.write().await;
        let stale: Vec<String> = neighbours
            .iter()
            .filter(|(_, node)| {
                node.last_seen
                    .map(|seen| seen.elapsed() > self.config.prune_interval)
                    .unwrap_or(true)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in stale {
            debug!("pruning neighbour {}: prune threshold reached", id);
            if let Err(e) = self.prune_node(&mut neighbours, &id).await {
                debug!("failed to prune neighbour {}: {}", id, e);
            }
        }
    }

    /// Remove a neighbour and cascade-delete every route it originated.
    /// The caller holds the neighbourhood write lock.
    async fn prune_node(
        &self,
        neighbours: &mut HashMap<String, Node>,
        id: &str,
    ) -> NetworkResult<()> {
        neighbours.remove(id);

        let query = Query {
            router: Some(id.to_string()),
            ..Default::default()
        };
        let routes = match self.router.table().query(&query).await {
            Ok(routes) => routes,
            Err(RouterError::RouteNotFound) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        for route in routes {
            match self.router.table().delete(&route).await {
                Ok(()) | Err(RouterError::RouteNotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    // ── network channel ──────────────────────────────────────────────

    /// Demultiplex membership messages from the network channel.
    async fn process_net(
        self: Arc<Self>,
        listener: TunnelListener,
        mut closed: watch::Receiver<bool>,
    ) {
        let (tx, mut rx) = mpsc::channel(MSG_BACKLOG);
        tokio::spawn(accept_sessions(listener, tx, closed.clone()));

        loop {
            tokio::select! {
                _ = closed.changed() => return,
                frame = rx.recv() => {
                    let Some(frame) = frame else { return };
                    self.handle_net_frame(frame).await;
                }
            }
        }
    }

    async fn handle_net_frame(&self, frame: Frame) {
        match frame.header(proto::HEADER_METHOD) {
            Some(proto::METHOD_CONNECT) => match proto::decode::<ConnectPayload>(&frame.body) {
                Ok(payload) => self.handle_connect(payload).await,
                Err(e) => debug!("invalid connect payload: {}", e),
            },
            Some(proto::METHOD_NEIGHBOUR) => match proto::decode::<NeighbourPayload>(&frame.body)
            {
                Ok(payload) => self.handle_neighbour(payload).await,
                Err(e) => debug!("invalid neighbour payload: {}", e),
            },
            Some(proto::METHOD_CLOSE) => match proto::decode::<ClosePayload>(&frame.body) {
                Ok(payload) => self.handle_close(payload).await,
                Err(e) => debug!("invalid close payload: {}", e),
            },
            other => trace!("ignoring network message with method {:?}", other),
        }
    }

    async fn handle_connect(&self, payload: ConnectPayload) {
        // never process our own messages
        if payload.node.id == self.id {
            return;
        }
        let mut neighbours = self.neighbours.write().await;
        if neighbours.contains_key(&payload.node.id) {
            return;
        }
        debug!("registering neighbour {}", payload.node.id);
        neighbours.insert(
            payload.node.id.clone(),
            Node::new(&payload.node.id, &payload.node.address),
        );
    }

    async fn handle_neighbour(&self, payload: NeighbourPayload) {
        if payload.node.id == self.id {
            return;
        }
        let mut neighbours = self.neighbours.write().await;
        let entry = neighbours
            .entry(payload.node.id.clone())
            .or_insert_with(|| Node::new(&payload.node.id, &payload.node.address));

        // the announcement is the gossip heartbeat
        entry.last_seen = Some(std::time::Instant::now());

        for neighbour in payload.neighbours {
            entry.neighbours.insert(
                neighbour.id.clone(),
                Node::new(&neighbour.id, &neighbour.address),
            );
        }
    }

    async fn handle_close(&self, payload: ClosePayload) {
        if payload.node.id == self.id {
            return;
        }
        debug!("neighbour {} left the network", payload.node.id);
        let mut neighbours = self.neighbours.write().await;
        if let Err(e) = self.prune_node(&mut neighbours, &payload.node.id).await {
            debug!("failed to prune neighbour {}: {}", payload.node.id, e);
        }
    }

    // ── control channel ──────────────────────────────────────────────

    /// Demultiplex route adverts from the control channel.
    async fn process_ctrl(
        self: Arc<Self>,
        listener: TunnelListener,
        mut closed: watch::Receiver<bool>,
    ) {
        let (tx, mut rx) = mpsc::channel(MSG_BACKLOG);
        tokio::spawn(accept_sessions(listener, tx, closed.clone()));

        loop {
            tokio::select! {
                _ = closed.changed() => return,
                frame = rx.recv() => {
                    let Some(frame) = frame else { return };
                    self.handle_ctrl_frame(frame).await;
                }
            }
        }
    }

    async fn handle_ctrl_frame(&self, frame: Frame) {
        match frame.header(proto::HEADER_METHOD) {
            Some(proto::METHOD_ADVERT) => match proto::decode::<AdvertRecord>(&frame.body) {
                Ok(record) => self.handle_advert(record).await,
                Err(e) => debug!("invalid advert payload: {}", e),
            },
            other => trace!("ignoring control message with method {:?}", other),
        }
    }

    async fn handle_advert(&self, record: AdvertRecord) {
        if record.id == self.id {
            return;
        }
        let mut neighbours = self.neighbours.write().await;

        if !neighbours.contains_key(&record.id) {
            // the advertiser beat its own membership messages to us
            neighbours.insert(record.id.clone(), Node::new(&record.id, ""));
        }
        // the gateway of an advertised route is the advertiser's own
        // bind address, so it back-fills a missing address
        if let Some(first) = record.events.first() {
            if let Some(advertiser) = neighbours.get_mut(&record.id) {
                if advertiser.address.is_empty() {
                    advertiser.address = first.route.gateway.clone();
                }
            }
        }

        let mut events = Vec::new();
        for event in &record.events {
            let origin = &event.route.router;
            if *origin != record.id {
                // relayed route: unless the origin is in the
                // advertiser's reported neighbourhood we cannot rule
                // out a routing loop from our 2-hop view
                let verified = neighbours
                    .get(&record.id)
                    .map(|n| n.neighbours.contains_key(origin))
                    .unwrap_or(false);
                if !verified {
                    debug!("dropping advert event with unverifiable origin {}", origin);
                    continue;
                }
            }

            let mut route = Route::from(event.route.clone());
            route.metric = route_metric(&route.router, &self.id, &neighbours);
            if route.metric > MAX_METRIC {
                continue;
            }

            events.push(Event {
                kind: event.kind,
                timestamp: event.timestamp,
                route,
            });
        }
        drop(neighbours);

        let advert = Advert {
            id: record.id,
            kind: record.kind,
            timestamp: record.timestamp,
            ttl: record.ttl,
            events,
        };
        if let Err(e) = self.router.process(advert).await {
            debug!("router failed to process advert: {}", e);
        }
    }

    /// Flood the router's adverts over the control channel, rewriting
    /// every event to point back at us.
    async fn advertise_loop(
        self: Arc<Self>,
        client: Arc<Session>,
        mut advert_rx: mpsc::Receiver<Advert>,
        address: String,
        mut closed: watch::Receiver<bool>,
    ) {
        loop {
            let advert = tokio::select! {
                _ = closed.changed() => return,
                advert = advert_rx.recv() => {
                    let Some(advert) = advert else { return };
                    advert
                }
            };

            let record = AdvertRecord {
                id: advert.id,
                kind: advert.kind,
                timestamp: advert.timestamp,
                ttl: advert.ttl,
                events: advert
                    .events
                    .into_iter()
                    .map(|event| {
                        let mut route = RouteRecord::from(event.route);
                        // we are the next hop for everything we advertise
                        route.gateway = address.clone();
                        route.link = DEFAULT_LINK.to_string();
                        proto::EventRecord {
                            kind: event.kind,
                            timestamp: event.timestamp,
                            route,
                        }
                    })
                    .collect(),
            };

            let body = match proto::encode(&record) {
                Ok(body) => body,
                Err(e) => {
                    debug!("failed to marshal advert: {}", e);
                    continue;
                }
            };
            let mut frame = Frame::with_body(body);
            frame.set_header(proto::HEADER_METHOD, proto::METHOD_ADVERT);
            if let Err(e) = client.send(frame).await {
                debug!("failed to send advert: {}", e);
            }
        }
    }
}

/// Graph-distance cost of a route: 1 for our own routes, 10 for a
/// direct neighbour's, 100 for a neighbour-of-neighbour's, 1000 beyond.
fn route_metric(router_id: &str, local_id: &str, neighbours: &HashMap<String, Node>) -> u64 {
    if router_id == local_id {
        return 1;
    }
    if neighbours.contains_key(router_id) {
        return 10;
    }
    for node in neighbours.values() {
        if node.neighbours.contains_key(router_id) {
            return 100;
        }
    }
    1000
}

/// Accept sessions on a channel listener and pump each one's frames
/// into a single queue.
async fn accept_sessions(
    listener: TunnelListener,
    tx: mpsc::Sender<Frame>,
    closed: watch::Receiver<bool>,
) {
    let mut closed_rx = closed.clone();
    loop {
        tokio::select! {
            _ = closed_rx.changed() => return,
            res = listener.accept() => match res {
                Ok(session) => {
                    tokio::spawn(pump_session(session, tx.clone(), closed.clone()));
                }
                Err(e) => {
                    debug!("channel {} accept failed: {}", listener.channel(), e);
                    return;
                }
            }
        }
    }
}

async fn pump_session(session: Session, tx: mpsc::Sender<Frame>, mut closed: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = closed.changed() => return,
            res = session.recv() => match res {
                Ok(frame) => {
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticResolver;
    use crate::router::{AdvertType, EventType, MemoryRouter, RouteTable, now_nanos};
    use overmesh_tunnel::{TcpTransport, TunnelConfig};
    use std::time::{Duration, Instant};
    use tokio::time::sleep;

    fn test_node(id: &str, nodes: Vec<String>) -> (Arc<Network>, Arc<MemoryRouter>) {
        let tunnel = Arc::new(Tunnel::new(
            TunnelConfig {
                token: "net-test".to_string(),
                address: "127.0.0.1:0".to_string(),
                reconnect_interval: Duration::from_millis(100),
                ..Default::default()
            },
            Arc::new(TcpTransport::new()),
        ));
        let router = Arc::new(MemoryRouter::new(id));
        let config = NetworkConfig {
            id: id.to_string(),
            name: "overmesh-test".to_string(),
            nodes,
            announce_interval: Duration::from_millis(200),
            prune_interval: Duration::from_secs(10),
            ..Default::default()
        };
        let network = Network::new(
            config,
            tunnel,
            router.clone(),
            Arc::new(StaticResolver::default()),
        );
        (network, router)
    }

    fn test_route(service: &str, router: &str, gateway: &str) -> Route {
        Route {
            service: service.to_string(),
            address: format!("{}:8080", service),
            gateway: gateway.to_string(),
            network: "overmesh-test".to_string(),
            router: router.to_string(),
            link: DEFAULT_LINK.to_string(),
            metric: 1,
        }
    }

    #[test]
    fn test_route_metric_ladder() {
        let mut n1 = Node::new("n1", "addr-1");
        n1.neighbours.insert("n2".to_string(), Node::new("n2", "addr-2"));
        let mut neighbours = HashMap::new();
        neighbours.insert("n1".to_string(), n1);

        assert_eq!(route_metric("self", "self", &neighbours), 1);
        assert_eq!(route_metric("n1", "self", &neighbours), 10);
        assert_eq!(route_metric("n2", "self", &neighbours), 100);
        assert_eq!(route_metric("stranger", "self", &neighbours), 1000);
    }

    #[tokio::test]
    async fn test_advert_loop_guard() {
        let (network, router) = test_node("self", vec![]);

        // n1 is a neighbour that has not reported z in its own view
        network
            .neighbours
            .write()
            .await
            .insert("n1".to_string(), Node::new("n1", "addr-1"));

        let record = AdvertRecord {
            id: "n1".to_string(),
            kind: AdvertType::Update,
            timestamp: now_nanos(),
            ttl: 0,
            events: vec![proto::EventRecord {
                kind: EventType::Create,
                timestamp: now_nanos(),
                route: test_route("svc", "z", "addr-1").into(),
            }],
        };
        network.handle_advert(record.clone()).await;
        assert!(router.table().list().await.unwrap().is_empty());

        // once n1 vouches for z the same event passes with metric 100
        network
            .neighbours
            .write()
            .await
            .get_mut("n1")
            .unwrap()
            .neighbours
            .insert("z".to_string(), Node::new("z", "addr-z"));

        network.handle_advert(record).await;
        let routes = router.table().list().await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].metric, 100);
    }

    #[tokio::test]
    async fn test_advert_backfills_advertiser_address() {
        let (network, _router) = test_node("self", vec![]);

        let record = AdvertRecord {
            id: "n1".to_string(),
            kind: AdvertType::Update,
            timestamp: now_nanos(),
            ttl: 0,
            events: vec![proto::EventRecord {
                kind: EventType::Create,
                timestamp: now_nanos(),
                route: test_route("svc", "n1", "10.1.1.1:8085").into(),
            }],
        };
        network.handle_advert(record).await;

        let neighbours = network.neighbours.read().await;
        assert_eq!(neighbours.get("n1").unwrap().address, "10.1.1.1:8085");
    }

    #[tokio::test]
    async fn test_prune_cascades_route_deletion() {
        let (network, router) = test_node("self", vec![]);

        let mut stale = Node::new("x", "addr-x");
        stale.last_seen = Some(Instant::now() - Duration::from_secs(11));
        network
            .neighbours
            .write()
            .await
            .insert("x".to_string(), stale);

        let route = test_route("svc-x", "x", "addr-x");
        router.table().update(route.clone()).await.unwrap();

        network.prune_once().await;

        assert!(network.neighbours.read().await.is_empty());
        let query = Query {
            router: Some("x".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            router.table().query(&query).await,
            Err(RouterError::RouteNotFound)
        ));
    }

    #[tokio::test]
    async fn test_neighbour_refreshes_last_seen() {
        let (network, _router) = test_node("self", vec![]);

        let payload = NeighbourPayload {
            node: NodeRecord {
                id: "n1".to_string(),
                address: "addr-1".to_string(),
            },
            neighbours: vec![],
        };
        network.handle_neighbour(payload.clone()).await;
        let first = network
            .neighbours
            .read()
            .await
            .get("n1")
            .unwrap()
            .last_seen
            .unwrap();

        sleep(Duration::from_millis(20)).await;
        network.handle_neighbour(payload).await;
        let second = network
            .neighbours
            .read()
            .await
            .get("n1")
            .unwrap()
            .last_seen
            .unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_own_messages_are_ignored() {
        let (network, _router) = test_node("self", vec![]);

        network
            .handle_connect(ConnectPayload {
                node: NodeRecord {
                    id: "self".to_string(),
                    address: "addr".to_string(),
                },
            })
            .await;
        assert!(network.neighbours.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_two_node_discovery_and_adverts() {
        let (a, router_a) = test_node("node-a", vec![]);
        a.connect().await.unwrap();
        let addr_a = a.address().await;

        let (b, router_b) = test_node("node-b", vec![addr_a.clone()]);
        b.connect().await.unwrap();

        // membership: each side discovers the other within a few
        // announce intervals
        let mut discovered = false;
        for _ in 0..50 {
            let a_sees = a.nodes().await.iter().any(|n| n.id == "node-b");
            let b_sees = b.nodes().await.iter().any(|n| n.id == "node-a");
            if a_sees && b_sees {
                discovered = true;
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        assert!(discovered, "nodes failed to discover each other");

        // route adverts: a route published by node-a shows up in
        // node-b's table with the gateway rewritten to node-a
        router_a
            .publish(Advert {
                id: "node-a".to_string(),
                kind: AdvertType::Update,
                timestamp: now_nanos(),
                ttl: 0,
                events: vec![Event {
                    kind: EventType::Create,
                    timestamp: now_nanos(),
                    route: test_route("svc-a", "node-a", "overwritten"),
                }],
            })
            .await
            .unwrap();

        let mut routed = None;
        for _ in 0..50 {
            if let Ok(routes) = router_b
                .table()
                .query(&Query {
                    service: Some("svc-a".to_string()),
                    ..Default::default()
                })
                .await
            {
                routed = Some(routes[0].clone());
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }

        let route = routed.expect("advert never reached node-b");
        assert_eq!(route.gateway, addr_a);
        assert_eq!(route.link, DEFAULT_LINK);
        assert_eq!(route.metric, 10);

        b.close().await.unwrap();
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_and_close_are_idempotent() {
        let (network, _router) = test_node("solo", vec![]);
        network.connect().await.unwrap();
        network.connect().await.unwrap();
        network.close().await.unwrap();
        network.close().await.unwrap();
    }
}
