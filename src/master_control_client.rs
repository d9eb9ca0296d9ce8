//! Master Control Client (C3, §4.3): a thin typed wrapper over `Client`
//! for the coordinator side of the protocol — publishes `order` and
//! `instantActions`, tracks every AGV's `state`/`visualization`/
//! `connection`/`factsheet`.

use std::sync::Arc;

use crate::agv_id::{AgvId, PartialAgvId};
use crate::client::Client;
use crate::errors::ClientError;
use crate::protocol::Stamped;
use crate::topic::Topic;

/// Not an AGV itself: this client does not publish `connection` and
/// carries no last-will message (§4.3).
#[derive(Clone)]
pub struct MasterControlClient {
    inner: Client,
}

impl MasterControlClient {
    pub fn from_client(inner: Client) -> Self {
        Self { inner }
    }

    pub fn client(&self) -> &Client {
        &self.inner
    }

    pub async fn start(&self) -> Result<(), ClientError> {
        self.inner.start().await
    }

    pub async fn stop(&self) -> Result<(), ClientError> {
        self.inner.stop().await
    }

    /// Publishes an order to a concrete AGV, returning the stamped
    /// envelope actually sent (§4.3, §4.5.1).
    pub async fn publish_order<T>(&self, agv_id: &AgvId, order: T) -> Result<Option<Stamped<T>>, ClientError>
    where
        T: serde::Serialize,
    {
        self.inner.publish(&Topic::Order, agv_id, order, None).await
    }

    pub async fn publish_instant_actions<T>(
        &self,
        agv_id: &AgvId,
        instant_actions: T,
    ) -> Result<Option<Stamped<T>>, ClientError>
    where
        T: serde::Serialize,
    {
        self.inner.publish(&Topic::InstantActions, agv_id, instant_actions, None).await
    }

    /// `trackAgvs(callback)` (§4.3): subscribes a single handler to every
    /// AGV's `state`, `visualization`, `connection`, and `factsheet`
    /// topics, fanning inbound messages of all four kinds through one
    /// callback distinguished by the `Topic` argument.
    pub async fn track_agvs<F>(&self, handler: F) -> Result<Vec<uuid::Uuid>, ClientError>
    where
        F: Fn(&Topic, &AgvId, &serde_json::Value) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        let handler = Arc::new(handler);
        let mut ids = Vec::with_capacity(4);
        for topic in [Topic::State, Topic::Visualization, Topic::Connection, Topic::Factsheet] {
            let h = handler.clone();
            let id = self
                .inner
                .subscribe(Some(topic), PartialAgvId::wildcard(), move |t, a, v| h(t, a, v))
                .await?;
            ids.push(id);
        }
        Ok(ids)
    }
}
