//! Pub/Sub Client (C2, §4.2): MQTT session lifecycle, header stamping,
//! inbound routing, and the topic/payload validation hook, atop a single
//! `paho-mqtt` session per client — a stateful, restartable client type
//! replacing free-function MQTT handling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use paho_mqtt as mqtt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::agv_id::{AgvId, PartialAgvId};
use crate::errors::{ClientError, ValidationError};
use crate::header::{Header, HeaderCounters};
use crate::mqtt_utils;
use crate::protocol::vda_2_0_0::{ConnectionBody, ConnectionState};
use crate::protocol::{ProtocolVersion, Stamped};
use crate::subscription::{Handler, SubscriptionManager, TopicFormat};
use crate::topic::{ExtensionTopicRegistration, Topic};

/// `Stopped -> Starting -> Started -> Stopping -> Stopped` (§4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Validates a topic/payload pair before it is published or after it is
/// decoded off the wire; the crate only consumes this hook (§1, §4.2).
pub type ValidateFn = Arc<dyn Fn(&Topic, &serde_json::Value) -> Result<(), ValidationError> + Send + Sync>;

#[derive(Clone, Copy, Debug)]
pub enum MqttProtocolVersion {
    V3_1_1,
    V5,
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub interface_name: String,
    pub topic_format: String,
    pub protocol_version: ProtocolVersion,
    pub mqtt_protocol_version: MqttProtocolVersion,
    pub broker_uri: String,
    pub connect_timeout: Duration,
    pub inbound_message_channel_capacity: usize,
}

/// Per-publish overrides (§4.2).
#[derive(Clone, Debug)]
pub struct PublishOptions {
    pub qos: i32,
    pub retained: bool,
    pub drop_if_offline: bool,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self { qos: 0, retained: false, drop_if_offline: false, timestamp: None }
    }
}

struct Inner {
    state: ClientState,
    mqtt: Option<mqtt::AsyncClient>,
    subscriptions: SubscriptionManager,
    counters: HeaderCounters,
    extensions: HashMap<String, ExtensionTopicRegistration>,
    dispatch_task: Option<JoinHandle<()>>,
}

struct Shared {
    agv_id: AgvId,
    config: ClientConfig,
    validate_inbound: Option<ValidateFn>,
    validate_outbound: Option<ValidateFn>,
    /// `Some` for an `AgvClient` (its own Connection topic is its LWT);
    /// `None` for a `MasterControlClient` (§4.3: "this client does not
    /// publish Connection").
    last_will: bool,
    inner: Mutex<Inner>,
}

/// `C2`. Cheaply `Clone`-able: clones share the same session and mutable
/// state, matching the "single logical actor per client" model (§5).
#[derive(Clone)]
pub struct Client(Arc<Shared>);

impl Client {
    pub fn new(
        agv_id: AgvId,
        config: ClientConfig,
        last_will: bool,
        validate_inbound: Option<ValidateFn>,
        validate_outbound: Option<ValidateFn>,
    ) -> Result<Self, ClientError> {
        let format = TopicFormat::new(&config.topic_format).map_err(crate::errors::ClientError::Subscription)?;
        let subscriptions =
            SubscriptionManager::new(format, config.interface_name.clone(), config.protocol_version.major_version());

        Ok(Client(Arc::new(Shared {
            agv_id,
            config,
            validate_inbound,
            validate_outbound,
            last_will,
            inner: Mutex::new(Inner {
                state: ClientState::Stopped,
                mqtt: None,
                subscriptions,
                counters: HeaderCounters::new(),
                extensions: HashMap::new(),
                dispatch_task: None,
            }),
        })))
    }

    pub fn agv_id(&self) -> &AgvId {
        &self.0.agv_id
    }

    pub async fn state(&self) -> ClientState {
        self.0.inner.lock().await.state
    }

    fn connection_body(state: ConnectionState) -> ConnectionBody {
        ConnectionBody { connection_state: state }
    }

    fn mqtt_topic(&self, agv_id: &AgvId, topic: &Topic) -> String {
        // The client's own identity and broker-assigned topic format
        // determine the physical MQTT topic for a concrete publish; this
        // mirrors `SubscriptionManager::add`'s resolution but always with
        // every field concrete (no wildcards).
        format!(
            "{}/{}/{}/{}/{}",
            self.0.config.interface_name,
            self.0.config.protocol_version.major_version(),
            agv_id.manufacturer,
            agv_id.serial_number,
            topic
        )
    }

    /// `start()` (§4.2). Idempotent once `Started`; rejects a concurrent
    /// `start()` while a previous attempt is in flight rather than
    /// queuing it.
    ///
    /// The `Starting` transition is claimed under its own short-lived lock
    /// acquisition, released before the `connect()` await: holding the
    /// guard across that await would make a racing `start()` block on the
    /// same mutex instead of observing `Starting` and failing immediately
    /// (§8: consecutive `start()` calls while the broker is unreachable
    /// must fail, not queue silently).
    pub async fn start(&self) -> Result<(), ClientError> {
        {
            let mut inner = self.0.inner.lock().await;
            match inner.state {
                ClientState::Started => return Ok(()),
                ClientState::Starting | ClientState::Stopping => return Err(ClientError::StartInProgress),
                ClientState::Stopped => {}
            }
            inner.state = ClientState::Starting;
        }

        let create_opts = mqtt_utils::mqtt_create_opts(&self.0.config.broker_uri);
        let mqtt_client = match mqtt::AsyncClient::new(create_opts).map_err(ClientError::Mqtt) {
            Ok(c) => c,
            Err(e) => {
                self.0.inner.lock().await.state = ClientState::Stopped;
                return Err(e);
            }
        };
        let mut message_stream = mqtt_client.get_stream(self.0.config.inbound_message_channel_capacity);

        let mqtt_version = match self.0.config.mqtt_protocol_version {
            MqttProtocolVersion::V3_1_1 => mqtt::MQTT_VERSION_3_1_1,
            MqttProtocolVersion::V5 => mqtt::MQTT_VERSION_5,
        };
        let mut conn_builder = mqtt::ConnectOptionsBuilder::with_mqtt_version(mqtt_version);
        conn_builder.clean_start(true).connect_timeout(self.0.config.connect_timeout);

        if self.0.last_will {
            let lwt_body = Self::connection_body(ConnectionState::ConnectionBroken);
            let header = Header::stamp(&self.0.agv_id, self.0.config.protocol_version.version_string(), 0, None);
            let stamped = Stamped::new(header, lwt_body);
            let payload = match serde_json::to_vec(&stamped).map_err(|e| ValidationError::NotSerializable(e.to_string())) {
                Ok(p) => p,
                Err(e) => {
                    self.0.inner.lock().await.state = ClientState::Stopped;
                    return Err(e.into());
                }
            };
            let topic = self.mqtt_topic(&self.0.agv_id, &Topic::Connection);
            let will = mqtt::MessageBuilder::new().topic(topic).payload(payload).qos(1).retained(true).finalize();
            conn_builder.will_message(will);
        }

        // No lock held across this await: a racing `start()` sees
        // `Starting` (claimed above) and fails fast instead of blocking
        // here and retrying once we release.
        let connect_result = mqtt_client.connect(conn_builder.finalize()).await;

        let mut inner = self.0.inner.lock().await;
        if let Err(err) = connect_result {
            inner.state = ClientState::Stopped;
            return Err(ClientError::Connect(err.to_string()));
        }

        inner.mqtt = Some(mqtt_client.clone());
        inner.state = ClientState::Started;

        if self.0.last_will {
            drop(inner);
            self.publish(&Topic::Connection, &self.0.agv_id.clone(), Self::connection_body(ConnectionState::Online), Some(PublishOptions { retained: true, qos: 1, ..Default::default() })).await?;
            inner = self.0.inner.lock().await;
        }

        // Re-install all previously registered subscriptions (§4.2 step 4).
        let filters = inner.subscriptions.get_all();
        for filter in &filters {
            if let Err(e) = mqtt_client.subscribe(filter, 1).await {
                tracing::warn!(filter, error = %e, "failed to re-install subscription");
            }
        }

        let dispatch_client = self.clone();
        inner.dispatch_task = Some(tokio::spawn(async move {
            while let Some(item) = message_stream.next().await {
                match item {
                    Some(msg) => dispatch_client.handle_inbound(msg).await,
                    None => dispatch_client.handle_connection_loss().await,
                }
            }
        }));

        Ok(())
    }

    async fn handle_connection_loss(&self) {
        let mqtt_client = {
            let inner = self.0.inner.lock().await;
            inner.mqtt.clone()
        };
        if let Some(client) = mqtt_client {
            tracing::warn!("lost connection to broker, reconnecting");
            while let Err(err) = client.reconnect().await {
                tracing::warn!(error = %err, "reconnect failed, retrying");
                tokio::time::sleep(Duration::from_millis(1000)).await;
            }
            tracing::info!("reconnected to broker");
        }
    }

    async fn handle_inbound(&self, msg: mqtt::Message) {
        let topic_path = msg.topic().to_string();
        let payload = msg.payload();

        let value: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(serde_json::Value::Object(map)) => serde_json::Value::Object(map),
            Ok(_) => {
                tracing::warn!(topic = %topic_path, "dropping inbound payload: not a JSON object");
                return;
            }
            Err(e) => {
                tracing::warn!(topic = %topic_path, error = %e, "dropping malformed inbound payload");
                return;
            }
        };

        let mut inner = self.0.inner.lock().await;

        let Some(topic_str) = inner.subscriptions.topic_format().extract_topic(&topic_path).map(|s| s.to_string())
        else {
            tracing::warn!(topic = %topic_path, "dropping inbound payload: topic not resolvable");
            return;
        };
        let topic = Topic::parse(&topic_str).expect("non-empty topic string always parses");

        let Some(agv_id) = inner.subscriptions.topic_format().extract_agv_id(&topic_path) else {
            tracing::warn!(topic = %topic_path, "dropping inbound payload: agv id not resolvable");
            return;
        };

        if let Some(validator) = &self.0.validate_inbound {
            if let Err(e) = validator(&topic, &value) {
                tracing::warn!(topic = %topic_path, error = %e, "dropping inbound payload: validation failed");
                return;
            }
        }

        let (handlers, _resolved_topic) = inner.subscriptions.find(&topic_path, &agv_id);
        // Handlers run while still holding the inner lock: this is what
        // gives us "no two inbound callbacks for a given client execute
        // concurrently" (§5) without a separate actor/queue plumbing.
        for handler in handlers {
            if let Err(err) = handler(&topic, &agv_id, &value) {
                tracing::error!(topic = %topic_path, error = %err, "subscription handler failed");
            }
        }
    }

    /// `stop()` (§4.2). Idempotent once `Stopped`.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let mut inner = self.0.inner.lock().await;
        if inner.state == ClientState::Stopped {
            return Ok(());
        }
        inner.state = ClientState::Stopping;

        if self.0.last_will {
            if let Some(mqtt_client) = inner.mqtt.clone() {
                drop(inner);
                let _ = self
                    .publish(
                        &Topic::Connection,
                        &self.0.agv_id.clone(),
                        Self::connection_body(ConnectionState::Offline),
                        Some(PublishOptions { retained: true, qos: 1, ..Default::default() }),
                    )
                    .await;
                let _ = mqtt_client.disconnect(None).await;
                inner = self.0.inner.lock().await;
            }
        } else if let Some(mqtt_client) = inner.mqtt.clone() {
            let _ = mqtt_client.disconnect(None).await;
        }

        if let Some(task) = inner.dispatch_task.take() {
            task.abort();
        }
        inner.mqtt = None;
        inner.state = ClientState::Stopped;
        Ok(())
    }

    fn validate_topic_direction(&self, topic: &Topic, extensions: &HashMap<String, ExtensionTopicRegistration>, outbound: bool) -> Result<(), ValidationError> {
        if let Topic::Extension(name) = topic {
            let registration = extensions.get(name).ok_or_else(|| ValidationError::UnknownExtensionTopic(name.clone()))?;
            let ok = if outbound { registration.outbound } else { registration.inbound };
            if !ok {
                let direction = if outbound { "outbound" } else { "inbound" };
                return Err(ValidationError::wrong_direction(name.clone(), direction));
            }
        }
        Ok(())
    }

    /// `publish(topic, agvId, headerless, options?)` (§4.2). Returns
    /// `None` when `dropIfOffline` suppressed the publish.
    pub async fn publish<T>(
        &self,
        topic: &Topic,
        agv_id: &AgvId,
        headerless: T,
        options: Option<PublishOptions>,
    ) -> Result<Option<Stamped<T>>, ClientError>
    where
        T: Serialize,
    {
        let options = options.unwrap_or_default();
        let mut inner = self.0.inner.lock().await;
        if inner.state != ClientState::Started {
            return Err(ClientError::NotStarted);
        }
        self.validate_topic_direction(topic, &inner.extensions, true)?;

        let header_id = inner.counters.next(topic);
        let header = Header::stamp(agv_id, self.0.config.protocol_version.version_string(), header_id, options.timestamp);
        let stamped = Stamped::new(header, headerless);

        let value = serde_json::to_value(&stamped).map_err(|e| ValidationError::NotSerializable(e.to_string()))?;
        if let Some(validator) = &self.0.validate_outbound {
            validator(topic, &value).map_err(ClientError::Validation)?;
        }
        let bytes = serde_json::to_vec(&value).map_err(|e| ValidationError::NotSerializable(e.to_string()))?;
        let mqtt_topic = self.mqtt_topic(agv_id, topic);
        let retained = options.retained || matches!(topic, Topic::Connection);

        match &inner.mqtt {
            Some(mqtt_client) if mqtt_client.is_connected() => {
                mqtt_utils::mqtt_publish(mqtt_client, &mqtt_topic, bytes, options.qos, retained)
                    .await
                    .map_err(ClientError::Mqtt)?;
                Ok(Some(stamped))
            }
            _ if options.drop_if_offline => {
                tracing::debug!(topic = %mqtt_topic, "dropping publish: client offline");
                Ok(None)
            }
            _ => Err(ClientError::NotStarted),
        }
    }

    /// `subscribe(topic|wildcard, partialAgvId, handler) -> subId`
    /// (§4.2).
    pub async fn subscribe<F>(
        &self,
        topic: Option<Topic>,
        partial_agv_id: PartialAgvId,
        handler: F,
    ) -> Result<Uuid, ClientError>
    where
        F: Fn(&Topic, &AgvId, &serde_json::Value) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        partial_agv_id.validate().map_err(ClientError::Validation)?;
        let mut inner = self.0.inner.lock().await;
        if let Some(Topic::Extension(_)) = &topic {
            self.validate_topic_direction(topic.as_ref().unwrap(), &inner.extensions, false)?;
        }
        let (sub_id, mqtt_filter, requires_subscribe): (Uuid, String, bool) =
            inner.subscriptions.add(topic.as_ref(), partial_agv_id, Self::handler_arc(handler))?;

        if requires_subscribe {
            if let Some(mqtt_client) = &inner.mqtt {
                mqtt_client.subscribe(&mqtt_filter, 1).await.map_err(ClientError::Mqtt)?;
            }
        }
        Ok(sub_id)
    }

    fn handler_arc<F>(handler: F) -> Handler
    where
        F: Fn(&Topic, &AgvId, &serde_json::Value) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(handler)
    }

    /// `unsubscribe` / subscription teardown, referenced in §4.1/§4.2.
    pub async fn unsubscribe(&self, sub_id: Uuid) -> Result<(), ClientError> {
        let mut inner = self.0.inner.lock().await;
        if let Some((mqtt_filter, requires_unsubscribe)) = inner.subscriptions.remove(sub_id) {
            if requires_unsubscribe {
                if let Some(mqtt_client) = &inner.mqtt {
                    mqtt_client.unsubscribe(&mqtt_filter).await.map_err(ClientError::Mqtt)?;
                }
            }
        }
        Ok(())
    }

    /// `registerExtensionTopic(name, inbound, outbound, validator)`
    /// (§4.2). The validator itself is folded into the client-wide
    /// inbound/outbound hooks (§1: the crate only consumes a single
    /// `validate(topic, obj)` hook per direction).
    pub async fn register_extension_topic(&self, name: impl Into<String>, inbound: bool, outbound: bool) {
        let name = name.into();
        let mut inner = self.0.inner.lock().await;
        inner.extensions.insert(name.clone(), ExtensionTopicRegistration { name, inbound, outbound });
    }
}
