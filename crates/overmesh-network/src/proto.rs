//! Overlay wire records
//!
//! Structured payloads carried in tunnel frames. The frame's
//! `Micro-Method` header names the record type; the body is the bincode
//! encoding of the matching record.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{NetworkError, NetworkResult};
use crate::router::{Advert, AdvertType, Event, EventType, Route};

/// Header naming the overlay method of a frame
pub const HEADER_METHOD: &str = "Micro-Method";

/// A node joined the network
pub const METHOD_CONNECT: &str = "connect";
/// A node announced its neighbourhood
pub const METHOD_NEIGHBOUR: &str = "neighbour";
/// A node left the network
pub const METHOD_CLOSE: &str = "close";
/// A batch of route events
pub const METHOD_ADVERT: &str = "advert";

/// Encode a record as a frame body
pub fn encode<T: Serialize>(value: &T) -> NetworkResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| NetworkError::Codec(e.to_string()))
}

/// Decode a frame body into a record
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> NetworkResult<T> {
    bincode::deserialize(bytes).map_err(|e| NetworkError::Codec(e.to_string()))
}

/// A node as carried in membership messages
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node id
    pub id: String,
    /// Node bind address
    pub address: String,
}

/// `connect`: a node introducing itself
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectPayload {
    /// The joining node
    pub node: NodeRecord,
}

/// `neighbour`: a node gossiping its one-hop view
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighbourPayload {
    /// The announcing node
    pub node: NodeRecord,
    /// Its reported neighbours
    pub neighbours: Vec<NodeRecord>,
}

/// `close`: a node leaving the network
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosePayload {
    /// The departing node
    pub node: NodeRecord,
}

/// A route as carried in adverts
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub service: String,
    pub address: String,
    pub gateway: String,
    pub network: String,
    pub router: String,
    pub link: String,
    pub metric: u64,
}

impl From<Route> for RouteRecord {
    fn from(route: Route) -> Self {
        Self {
            service: route.service,
            address: route.address,
            gateway: route.gateway,
            network: route.network,
            router: route.router,
            link: route.link,
            metric: route.metric,
        }
    }
}

impl From<RouteRecord> for Route {
    fn from(record: RouteRecord) -> Self {
        Self {
            service: record.service,
            address: record.address,
            gateway: record.gateway,
            network: record.network,
            router: record.router,
            link: record.link,
            metric: record.metric,
        }
    }
}

/// A route event as carried in adverts
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// What happened to the route
    pub kind: EventType,
    /// Unix nanoseconds when the event occurred
    pub timestamp: u64,
    /// The route affected
    pub route: RouteRecord,
}

/// `advert`: a batch of route events
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdvertRecord {
    /// Id of the advertising router
    pub id: String,
    /// Kind of batch
    pub kind: AdvertType,
    /// Unix nanoseconds when the advert was built
    pub timestamp: u64,
    /// Advert time-to-live in nanoseconds
    pub ttl: u64,
    /// The route events
    pub events: Vec<EventRecord>,
}

impl From<Advert> for AdvertRecord {
    fn from(advert: Advert) -> Self {
        Self {
            id: advert.id,
            kind: advert.kind,
            timestamp: advert.timestamp,
            ttl: advert.ttl,
            events: advert
                .events
                .into_iter()
                .map(|e| EventRecord {
                    kind: e.kind,
                    timestamp: e.timestamp,
                    route: e.route.into(),
                })
                .collect(),
        }
    }
}

impl From<AdvertRecord> for Advert {
    fn from(record: AdvertRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            timestamp: record.timestamp,
            ttl: record.ttl,
            events: record
                .events
                .into_iter()
                .map(|e| Event {
                    kind: e.kind,
                    timestamp: e.timestamp,
                    route: e.route.into(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neighbour_payload_roundtrip() {
        let payload = NeighbourPayload {
            node: NodeRecord {
                id: "n1".to_string(),
                address: "10.0.0.1:8085".to_string(),
            },
            neighbours: vec![NodeRecord {
                id: "n2".to_string(),
                address: "10.0.0.2:8085".to_string(),
            }],
        };

        let bytes = encode(&payload).unwrap();
        let decoded: NeighbourPayload = decode(&bytes).unwrap();
        assert_eq!(payload, decoded);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode::<ConnectPayload>(&[0xff, 0x01]).is_err());
    }
}
