//! The uniform envelope emitted for every ingested record, and the
//! asynchronous publisher that carries envelopes to the downstream bus.

mod publisher;

pub use publisher::{BusTransport, LogTransport, PublishError, Publisher, TransportError};

use serde::{Deserialize, Serialize};

/// Routing metadata carried by every envelope. Consumers reconcile by these
/// fields; the bus itself uses a single topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub customer: String,
    pub data_source: String,
    pub table_name: String,
    pub is_initial_import: Option<bool>,
}

impl Meta {
    pub fn new(customer: &str, data_source: &str, table_name: &str) -> Meta {
        Meta {
            customer: customer.to_owned(),
            data_source: data_source.to_owned(),
            table_name: table_name.to_owned(),
            is_initial_import: None,
        }
    }

    pub fn initial_import(mut self, is_initial: bool) -> Meta {
        self.is_initial_import = Some(is_initial);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub meta: Meta,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(meta: Meta, data: serde_json::Value) -> Envelope {
        Envelope { meta, data }
    }

    /// Compact UTF-8 JSON, the wire form accepted by the bus.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
