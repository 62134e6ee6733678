//! Batch lifecycle notifications
//!
//! Events are fire-and-forget: sinks never feed back into batch state.

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Module attribute attached to every event
pub const MODULE_NAME: &str = "bridge";

/// Bridge deployment the batches are destined for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeIdentity {
    pub contract_address: Address,
    pub chain_id: u64,
}

/// Notifications emitted by the batch manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchEvent {
    /// Outgoing batch created
    BatchCreated {
        bridge: BridgeIdentity,
        token_contract: Address,
        nonce: u64,
        elements: usize,
        total_fee: U256,
    },

    /// Outgoing batch canceled, its transfers returned to the pool
    BatchCanceled {
        bridge: BridgeIdentity,
        token_contract: Address,
        nonce: u64,
    },
}

impl BatchEvent {
    /// Get event kind
    pub fn kind(&self) -> &'static str {
        match self {
            BatchEvent::BatchCreated { .. } => "outgoing_batch",
            BatchEvent::BatchCanceled { .. } => "outgoing_batch_canceled",
        }
    }

    pub fn nonce(&self) -> u64 {
        match self {
            BatchEvent::BatchCreated { nonce, .. } => *nonce,
            BatchEvent::BatchCanceled { nonce, .. } => *nonce,
        }
    }

    pub fn token_contract(&self) -> Address {
        match self {
            BatchEvent::BatchCreated { token_contract, .. } => *token_contract,
            BatchEvent::BatchCanceled { token_contract, .. } => *token_contract,
        }
    }

    /// Flat string attributes for external sinks
    pub fn attributes(&self) -> BTreeMap<String, String> {
        let (bridge, token_contract, nonce) = match self {
            BatchEvent::BatchCreated {
                bridge,
                token_contract,
                nonce,
                ..
            }
            | BatchEvent::BatchCanceled {
                bridge,
                token_contract,
                nonce,
            } => (bridge, token_contract, nonce),
        };

        let mut attrs = BTreeMap::new();
        attrs.insert("module".to_string(), MODULE_NAME.to_string());
        attrs.insert(
            "bridge_contract".to_string(),
            format!("{:?}", bridge.contract_address),
        );
        attrs.insert("bridge_chain_id".to_string(), bridge.chain_id.to_string());
        attrs.insert("outgoing_batch_id".to_string(), nonce.to_string());
        attrs.insert("nonce".to_string(), nonce.to_string());
        attrs.insert("token_contract".to_string(), format!("{:?}", token_contract));

        if let BatchEvent::BatchCreated {
            elements,
            total_fee,
            ..
        } = self
        {
            attrs.insert("elements".to_string(), elements.to_string());
            attrs.insert("total_fee".to_string(), total_fee.to_string());
        }

        attrs
    }
}

/// Receives batch lifecycle notifications
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &BatchEvent);
}

/// Publishes events on a broadcast channel
pub struct BroadcastEventSink {
    event_tx: broadcast::Sender<BatchEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity);
        Self { event_tx }
    }

    /// Subscribe to batch events
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.event_tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: &BatchEvent) {
        // No subscribers is not an error
        let _ = self.event_tx.send(event.clone());
    }
}
