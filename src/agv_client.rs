//! AGV Client (C4, §4.4): a thin typed wrapper over `Client` for the
//! vehicle side of the protocol. Its `Connection` last-will/online/
//! offline sequence is handled by `Client::start`/`stop` (constructed
//! with `last_will = true`); this wrapper only adds the typed publish/
//! subscribe surface specific to an AGV's own topics.

use crate::agv_id::{AgvId, PartialAgvId};
use crate::client::{Client, ClientConfig, PublishOptions, ValidateFn};
use crate::errors::ClientError;
use crate::protocol::Stamped;
use crate::topic::Topic;

#[derive(Clone)]
pub struct AgvClient {
    inner: Client,
}

impl AgvClient {
    pub fn new(
        agv_id: AgvId,
        config: ClientConfig,
        validate_inbound: Option<ValidateFn>,
        validate_outbound: Option<ValidateFn>,
    ) -> Result<Self, ClientError> {
        Ok(Self { inner: Client::new(agv_id, config, true, validate_inbound, validate_outbound)? })
    }

    pub fn client(&self) -> &Client {
        &self.inner
    }

    pub fn agv_id(&self) -> &AgvId {
        self.inner.agv_id()
    }

    /// The topic this client publishes its `Connection` last will on:
    /// always its own `Connection` topic (§4.4).
    pub fn last_will_topic(&self) -> Topic {
        Topic::Connection
    }

    pub async fn start(&self) -> Result<(), ClientError> {
        self.inner.start().await
    }

    pub async fn stop(&self) -> Result<(), ClientError> {
        self.inner.stop().await
    }

    pub async fn publish_state<T>(&self, state: T) -> Result<Option<Stamped<T>>, ClientError>
    where
        T: serde::Serialize,
    {
        self.inner.publish(&Topic::State, self.agv_id(), state, None).await
    }

    /// Visualization is typically dropped rather than queued while
    /// offline, since a stale position is worse than a missed tick
    /// (§4.2's `dropIfOffline`, exercised here by default).
    pub async fn publish_visualization<T>(&self, visualization: T) -> Result<Option<Stamped<T>>, ClientError>
    where
        T: serde::Serialize,
    {
        self.inner
            .publish(
                &Topic::Visualization,
                self.agv_id(),
                visualization,
                Some(PublishOptions { drop_if_offline: true, ..Default::default() }),
            )
            .await
    }

    pub async fn publish_factsheet<T>(&self, factsheet: T) -> Result<Option<Stamped<T>>, ClientError>
    where
        T: serde::Serialize,
    {
        self.inner.publish(&Topic::Factsheet, self.agv_id(), factsheet, Some(PublishOptions { retained: true, ..Default::default() })).await
    }

    pub async fn subscribe_order<F>(&self, handler: F) -> Result<uuid::Uuid, ClientError>
    where
        F: Fn(&Topic, &AgvId, &serde_json::Value) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.inner.subscribe(Some(Topic::Order), self.agv_id().as_partial(), handler).await
    }

    pub async fn subscribe_instant_actions<F>(&self, handler: F) -> Result<uuid::Uuid, ClientError>
    where
        F: Fn(&Topic, &AgvId, &serde_json::Value) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.inner.subscribe(Some(Topic::InstantActions), self.agv_id().as_partial(), handler).await
    }

    pub async fn register_extension_topic(&self, name: impl Into<String>, inbound: bool, outbound: bool) {
        self.inner.register_extension_topic(name, inbound, outbound).await
    }
}

impl AsRef<Client> for AgvClient {
    fn as_ref(&self) -> &Client {
        &self.inner
    }
}
