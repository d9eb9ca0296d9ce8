//! Subscription Manager (C1, §4.1): reconciles application-level
//! subscriptions `(topic, partial AgvId)` against broker-level MQTT filters,
//! reference-counting the latter so that two application subscriptions
//! sharing a filter only issue one SUBSCRIBE/UNSUBSCRIBE.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::agv_id::{AgvId, PartialAgvId};
use crate::errors::SubscriptionError;
use crate::topic::Topic;

const MAX_TOPIC_BYTES: usize = 65535;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Placeholder {
    InterfaceName,
    MajorVersion,
    Manufacturer,
    SerialNumber,
    Topic,
}

impl Placeholder {
    fn parse(name: &str) -> Option<Placeholder> {
        Some(match name {
            "interfaceName" => Placeholder::InterfaceName,
            "majorVersion" => Placeholder::MajorVersion,
            "manufacturer" => Placeholder::Manufacturer,
            "serialNumber" => Placeholder::SerialNumber,
            "topic" => Placeholder::Topic,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug)]
enum Segment {
    Literal(String),
    Placeholder(Placeholder),
}

/// Values to substitute into a `TopicFormat`. A `None` field is rendered
/// as the MQTT single-level wildcard `+` (§4.1: "missing fields ... are
/// substituted with the ... wildcard").
#[derive(Clone, Debug, Default)]
pub struct ResolveValues<'a> {
    pub interface_name: Option<&'a str>,
    pub major_version: Option<&'a str>,
    pub manufacturer: Option<&'a str>,
    pub serial_number: Option<&'a str>,
    pub topic: Option<&'a str>,
}

/// A parsed, validated topic template, e.g.
/// `%interfaceName%/%majorVersion%/%manufacturer%/%serialNumber%/%topic%`.
///
/// Each placeholder is required to occupy an entire `/`-delimited level;
/// this mirrors every template in practice (the default one included) and
/// keeps wildcard substitution and `%topic%` extraction unambiguous.
#[derive(Clone, Debug)]
pub struct TopicFormat {
    segments: Vec<Segment>,
    topic_segment_index: usize,
    manufacturer_segment_index: Option<usize>,
    serial_number_segment_index: Option<usize>,
}

impl TopicFormat {
    pub fn new(format: &str) -> Result<TopicFormat, SubscriptionError> {
        let mut segments = Vec::new();
        let mut seen = HashMap::new();
        let mut topic_segment_index = None;
        let mut manufacturer_segment_index = None;
        let mut serial_number_segment_index = None;

        for (index, level) in format.split('/').enumerate() {
            if let Some(name) = level.strip_prefix('%').and_then(|s| s.strip_suffix('%')) {
                let placeholder = Placeholder::parse(name)
                    .ok_or_else(|| SubscriptionError::UnknownPlaceholder(name.to_string()))?;
                if seen.insert(name.to_string(), ()).is_some() {
                    return Err(SubscriptionError::DuplicatePlaceholder(name.to_string()));
                }
                match placeholder {
                    Placeholder::Topic => topic_segment_index = Some(index),
                    Placeholder::Manufacturer => manufacturer_segment_index = Some(index),
                    Placeholder::SerialNumber => serial_number_segment_index = Some(index),
                    _ => {}
                }
                segments.push(Segment::Placeholder(placeholder));
            } else {
                segments.push(Segment::Literal(level.to_string()));
            }
        }

        let topic_segment_index = topic_segment_index.ok_or(SubscriptionError::MissingTopicPlaceholder)?;

        Ok(TopicFormat {
            segments,
            topic_segment_index,
            manufacturer_segment_index,
            serial_number_segment_index,
        })
    }

    /// Renders the template with `values`, substituting `+` for any
    /// missing field. Returns an error if the resulting topic exceeds the
    /// 65535-byte UTF-8 boundary (§4.1, §8).
    pub fn resolve(&self, values: &ResolveValues) -> Result<String, SubscriptionError> {
        let levels: Vec<String> = self
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.clone(),
                Segment::Placeholder(Placeholder::InterfaceName) => {
                    values.interface_name.unwrap_or("+").to_string()
                }
                Segment::Placeholder(Placeholder::MajorVersion) => {
                    values.major_version.unwrap_or("+").to_string()
                }
                Segment::Placeholder(Placeholder::Manufacturer) => {
                    values.manufacturer.unwrap_or("+").to_string()
                }
                Segment::Placeholder(Placeholder::SerialNumber) => {
                    values.serial_number.unwrap_or("+").to_string()
                }
                Segment::Placeholder(Placeholder::Topic) => values.topic.unwrap_or("+").to_string(),
            })
            .collect();

        let resolved = levels.join("/");
        let byte_len = resolved.len();
        if byte_len > MAX_TOPIC_BYTES {
            return Err(SubscriptionError::ResolvedTopicTooLong { max: MAX_TOPIC_BYTES, actual: byte_len });
        }
        Ok(resolved)
    }

    pub fn extract_topic<'a>(&self, mqtt_topic: &'a str) -> Option<&'a str> {
        mqtt_topic.split('/').nth(self.topic_segment_index)
    }

    /// Recovers the concrete `AgvId` embedded in an inbound broker topic,
    /// when the template carries both identity placeholders (the default
    /// template always does; a custom one might not, see §6).
    pub fn extract_agv_id(&self, mqtt_topic: &str) -> Option<AgvId> {
        let levels: Vec<&str> = mqtt_topic.split('/').collect();
        let manufacturer = levels.get(self.manufacturer_segment_index?)?;
        let serial_number = levels.get(self.serial_number_segment_index?)?;
        AgvId::new(*manufacturer, *serial_number).ok()
    }
}

/// MQTT single-level-wildcard match: `+` matches exactly one topic level,
/// level counts must be identical.
fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some(fl), Some(tl)) => {
                if fl != "+" && fl != tl {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A subscription callback. Returns `Err` to report a failure without
/// unwinding; the client logs it and continues with the next handler/
/// message (§4.2 "per-message exception isolation").
pub type Handler = Arc<
    dyn Fn(&Topic, &AgvId, &serde_json::Value) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

struct SubscriptionRecord {
    mqtt_filter: String,
    partial_agv_id: PartialAgvId,
    handler: Handler,
}

/// Reference count and handle bookkeeping for a single broker-level
/// filter shared by one or more application subscriptions.
struct FilterEntry {
    ref_count: usize,
}

/// `C1`. See module docs and spec.md §4.1 for the exact contract.
pub struct SubscriptionManager {
    format: TopicFormat,
    interface_name: String,
    major_version: String,
    /// Insertion-ordered subscription ids; defines the dispatch order
    /// required by §4.1's "handlers ... invoked in insertion order".
    order: Vec<Uuid>,
    subscriptions: HashMap<Uuid, SubscriptionRecord>,
    filters: HashMap<String, FilterEntry>,
}

impl SubscriptionManager {
    pub fn new(format: TopicFormat, interface_name: impl Into<String>, major_version: impl Into<String>) -> Self {
        Self {
            format,
            interface_name: interface_name.into(),
            major_version: major_version.into(),
            order: Vec::new(),
            subscriptions: HashMap::new(),
            filters: HashMap::new(),
        }
    }

    /// `add(topic?, partialAgvId, handler) -> (subId, mqttFilter,
    /// requiresSubscribe)` (§4.1).
    pub fn add(
        &mut self,
        topic: Option<&Topic>,
        partial_agv_id: PartialAgvId,
        handler: Handler,
    ) -> Result<(Uuid, String, bool), SubscriptionError> {
        let topic_str = topic.map(|t| t.to_string());
        let values = ResolveValues {
            interface_name: Some(&self.interface_name),
            major_version: Some(&self.major_version),
            manufacturer: partial_agv_id.manufacturer.as_deref(),
            serial_number: partial_agv_id.serial_number.as_deref(),
            topic: topic_str.as_deref(),
        };
        let mqtt_filter = self.format.resolve(&values)?;

        let sub_id = Uuid::new_v4();
        let entry = self.filters.entry(mqtt_filter.clone()).or_insert(FilterEntry { ref_count: 0 });
        let requires_subscribe = entry.ref_count == 0;
        entry.ref_count += 1;

        self.subscriptions.insert(
            sub_id,
            SubscriptionRecord { mqtt_filter: mqtt_filter.clone(), partial_agv_id, handler },
        );
        self.order.push(sub_id);

        Ok((sub_id, mqtt_filter, requires_subscribe))
    }

    /// `remove(subId) -> (mqttFilter, requiresUnsubscribe)?` (§4.1).
    pub fn remove(&mut self, sub_id: Uuid) -> Option<(String, bool)> {
        let record = self.subscriptions.remove(&sub_id)?;
        self.order.retain(|id| *id != sub_id);

        let requires_unsubscribe = if let Some(entry) = self.filters.get_mut(&record.mqtt_filter) {
            entry.ref_count -= 1;
            let empty = entry.ref_count == 0;
            if empty {
                self.filters.remove(&record.mqtt_filter);
            }
            empty
        } else {
            false
        };

        Some((record.mqtt_filter, requires_unsubscribe))
    }

    /// `find(mqttTopic, concreteAgvId) -> (handlers, resolvedTopic)`
    /// (§4.1). Handlers are returned in insertion order; every matching
    /// handler appears exactly once (§8).
    pub fn find(&self, mqtt_topic: &str, concrete_agv_id: &AgvId) -> (Vec<Handler>, Option<String>) {
        let resolved_topic = self.format.extract_topic(mqtt_topic).map(|s| s.to_string());

        let handlers = self
            .order
            .iter()
            .filter_map(|id| self.subscriptions.get(id))
            .filter(|record| {
                filter_matches(&record.mqtt_filter, mqtt_topic) && concrete_agv_id.matches(&record.partial_agv_id)
            })
            .map(|record| record.handler.clone())
            .collect();

        (handlers, resolved_topic)
    }

    /// All currently subscribed broker filters (§4.1).
    pub fn get_all(&self) -> Vec<String> {
        self.filters.keys().cloned().collect()
    }

    pub fn topic_format(&self) -> &TopicFormat {
        &self.format
    }

    /// Drops all subscriptions without touching the broker (§4.1: "no side
    /// effect at the broker layer — caller must ensure disconnect").
    pub fn clear(&mut self) {
        self.order.clear();
        self.subscriptions.clear();
        self.filters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_handler() -> Handler {
        Arc::new(|_, _, _| Ok(()))
    }

    fn manager() -> SubscriptionManager {
        let format = TopicFormat::new("%interfaceName%/%majorVersion%/%manufacturer%/%serialNumber%/%topic%").unwrap();
        SubscriptionManager::new(format, "uagv", "v2")
    }

    #[test]
    fn rejects_format_without_topic_placeholder() {
        let format = TopicFormat::new("%interfaceName%/%manufacturer%/%serialNumber%");
        assert!(matches!(format, Err(SubscriptionError::MissingTopicPlaceholder)));
    }

    #[test]
    fn rejects_unknown_placeholder() {
        let format = TopicFormat::new("%bogus%/%topic%");
        assert!(matches!(format, Err(SubscriptionError::UnknownPlaceholder(_))));
    }

    #[test]
    fn rejects_duplicate_placeholder() {
        let format = TopicFormat::new("%topic%/%topic%");
        assert!(matches!(format, Err(SubscriptionError::DuplicatePlaceholder(_))));
    }

    #[test]
    fn second_subscription_to_same_filter_does_not_require_subscribe() {
        let mut mgr = manager();
        let partial = PartialAgvId { manufacturer: Some("X".into()), serial_number: Some("001".into()) };
        let (_id1, filter1, req1) = mgr.add(Some(&Topic::Order), partial.clone(), noop_handler()).unwrap();
        let (id2, filter2, req2) = mgr.add(Some(&Topic::Order), partial, noop_handler()).unwrap();
        assert_eq!(filter1, filter2);
        assert!(req1);
        assert!(!req2);
        assert_ne!(_id1, id2);
    }

    #[test]
    fn remove_reports_unsubscribe_only_when_refcount_hits_zero() {
        let mut mgr = manager();
        let partial = PartialAgvId { manufacturer: Some("X".into()), serial_number: Some("001".into()) };
        let (id1, _, _) = mgr.add(Some(&Topic::Order), partial.clone(), noop_handler()).unwrap();
        let (id2, _, _) = mgr.add(Some(&Topic::Order), partial, noop_handler()).unwrap();

        let (_, requires_unsub) = mgr.remove(id1).unwrap();
        assert!(!requires_unsub);
        let (_, requires_unsub) = mgr.remove(id2).unwrap();
        assert!(requires_unsub);
    }

    #[test]
    fn wildcard_fan_out_invokes_every_matching_handler_once_in_order() {
        let mut mgr = manager();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));

        let calls1 = calls.clone();
        let h1: Handler = Arc::new(move |_, _, _| {
            calls1.lock().unwrap().push("h1");
            Ok(())
        });
        let calls2 = calls.clone();
        let h2: Handler = Arc::new(move |_, _, _| {
            calls2.lock().unwrap().push("h2");
            Ok(())
        });

        mgr.add(Some(&Topic::Order), PartialAgvId { manufacturer: Some("X".into()), serial_number: None }, h1)
            .unwrap();
        mgr.add(
            Some(&Topic::Order),
            PartialAgvId { manufacturer: Some("X".into()), serial_number: Some("001".into()) },
            h2,
        )
        .unwrap();

        let agv_id = AgvId::new("X", "001").unwrap();
        let (handlers, resolved_topic) = mgr.find("uagv/v2/X/001/order", &agv_id);
        assert_eq!(handlers.len(), 2);
        assert_eq!(resolved_topic.as_deref(), Some("order"));

        for h in &handlers {
            h(&Topic::Order, &agv_id, &serde_json::Value::Null);
        }
        assert_eq!(*calls.lock().unwrap(), vec!["h1", "h2"]);
    }

    #[test]
    fn topic_length_boundary_is_enforced() {
        let format = TopicFormat::new("%topic%").unwrap();
        let long_topic = "a".repeat(MAX_TOPIC_BYTES + 1);
        let values = ResolveValues { topic: Some(&long_topic), ..Default::default() };
        assert!(matches!(format.resolve(&values), Err(SubscriptionError::ResolvedTopicTooLong { .. })));
    }

    #[test]
    fn clear_drops_everything_without_touching_refcounts_elsewhere() {
        let mut mgr = manager();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        mgr.add(
            Some(&Topic::State),
            PartialAgvId::wildcard(),
            Arc::new(move |_, _, _| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();
        assert_eq!(mgr.get_all().len(), 1);
        mgr.clear();
        assert!(mgr.get_all().is_empty());
    }
}
