//! Dispatch engine: inbound payloads to point writes, control values to publishes

use tracing::{debug, trace, warn};

use crate::error::BridgeError;
use crate::host::PointHost;
use crate::mqtt::{InboundMessage, QosLevel};
use crate::point::{PointId, PointTable, PointValue, Quality};

use super::registry::TopicRegistry;

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// No point owns the topic; message dropped
    Unresolved,
    /// Payload could not be coerced; point untouched
    Rejected(BridgeError),
    /// Same value and quality as cached; no write
    Unchanged(PointId),
    Updated(PointId),
}

/// Resolves, coerces and writes one inbound message.
pub fn deliver(
    points: &mut PointTable,
    registry: &TopicRegistry,
    host: &dyn PointHost,
    message: &InboundMessage,
) -> Delivery {
    let Some(id) = registry.resolve(&message.topic) else {
        debug!("No point registered for topic {}, dropping message", message.topic);
        return Delivery::Unresolved;
    };
    let Some(entry) = points.get_mut(id) else {
        warn!("Topic {} resolved to unknown point {}", message.topic, id);
        return Delivery::Unresolved;
    };

    let value = match entry.kind().coerce(&message.payload) {
        Ok(value) => value,
        Err(e) => {
            warn!("Point {} ({}): {}", id, entry.config.display_name(), e);
            return Delivery::Rejected(e);
        }
    };

    let delivery = if entry.value_changed(&value, Quality::Good) {
        trace!("Point {} <- {}", id, value);
        host.write_value(id, &value, Quality::Good);
        entry.set_value(value, Quality::Good);
        Delivery::Updated(id)
    } else {
        Delivery::Unchanged(id)
    };
    host.flush();
    delivery
}

/// A control value ready to publish
#[derive(Debug, Clone, PartialEq)]
pub struct ControlRequest {
    pub point: PointId,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QosLevel,
}

/// Resolves the publish topic and serializes `value` for `point`.
pub fn prepare_control(
    points: &PointTable,
    point: PointId,
    value: &PointValue,
) -> Result<ControlRequest, BridgeError> {
    let entry = points.get(point).ok_or(BridgeError::UnknownPoint(point))?;
    let payload = entry.kind().encode_control(point, value)?;
    Ok(ControlRequest {
        point,
        topic: entry.config.publish_topic().to_string(),
        payload,
        qos: entry.config.qos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::{PointConfig, PointKind};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Sink {
        writes: Mutex<Vec<(PointId, PointValue, Quality)>>,
        flushes: Mutex<usize>,
    }

    impl PointHost for Sink {
        fn write_value(&self, point: PointId, value: &PointValue, quality: Quality) {
            self.writes.lock().unwrap().push((point, value.clone(), quality));
        }

        fn flush(&self) {
            *self.flushes.lock().unwrap() += 1;
        }
    }

    fn setup() -> (PointTable, TopicRegistry) {
        let points = PointTable::from_configs(vec![
            PointConfig::new(1, "plant", PointKind::Analogue, "sensor/1"),
            PointConfig::new(2, "plant", PointKind::Digital, "valve/2")
                .with_control_topic("valve/2/set")
                .with_qos(QosLevel::AtLeastOnce),
            PointConfig::new(3, "plant", PointKind::Timestamp, "clock/3"),
        ]);
        let mut registry = TopicRegistry::new();
        for sub in points.subscriptions() {
            registry.register(&sub.topic, sub.point).unwrap();
        }
        (points, registry)
    }

    #[test]
    fn repeated_payload_is_written_once() {
        let (mut points, registry) = setup();
        let host = Sink::default();
        let message = InboundMessage::new("sensor/1", "42.5");

        assert_eq!(
            deliver(&mut points, &registry, &host, &message),
            Delivery::Updated(PointId(1))
        );
        assert_eq!(
            deliver(&mut points, &registry, &host, &message),
            Delivery::Unchanged(PointId(1))
        );

        let writes = host.writes.lock().unwrap();
        assert_eq!(
            *writes,
            vec![(PointId(1), PointValue::Analogue(42.5), Quality::Good)]
        );
        assert_eq!(*host.flushes.lock().unwrap(), 2);
        assert_eq!(
            points.get(PointId(1)).unwrap().value,
            Some(PointValue::Analogue(42.5))
        );
    }

    #[test]
    fn bad_payload_leaves_point_untouched() {
        let (mut points, registry) = setup();
        let host = Sink::default();
        deliver(&mut points, &registry, &host, &InboundMessage::new("sensor/1", "1.0"));

        let outcome = deliver(
            &mut points,
            &registry,
            &host,
            &InboundMessage::new("sensor/1", "notanumber"),
        );
        assert!(matches!(outcome, Delivery::Rejected(BridgeError::Coercion { .. })));
        assert_eq!(
            points.get(PointId(1)).unwrap().value,
            Some(PointValue::Analogue(1.0))
        );
        assert_eq!(host.writes.lock().unwrap().len(), 1);
        assert_eq!(*host.flushes.lock().unwrap(), 1);
    }

    #[test]
    fn unknown_topic_is_dropped() {
        let (mut points, registry) = setup();
        let host = Sink::default();
        let outcome = deliver(&mut points, &registry, &host, &InboundMessage::new("other", "1"));
        assert_eq!(outcome, Delivery::Unresolved);
        assert_eq!(*host.flushes.lock().unwrap(), 0);
    }

    #[test]
    fn control_uses_override_topic_and_qos() {
        let (points, _) = setup();
        let request = prepare_control(&points, PointId(2), &PointValue::Digital(1)).unwrap();
        assert_eq!(request.topic, "valve/2/set");
        assert_eq!(request.payload, b"1".to_vec());
        assert_eq!(request.qos, QosLevel::AtLeastOnce);

        let request = prepare_control(&points, PointId(1), &PointValue::Analogue(2.5)).unwrap();
        assert_eq!(request.topic, "sensor/1");
    }

    #[test]
    fn control_rejects_timestamp_and_unknown_points() {
        let (points, _) = setup();
        let now = PointValue::Timestamp(chrono::Utc::now());
        assert!(matches!(
            prepare_control(&points, PointId(3), &now),
            Err(BridgeError::UnsupportedControl { .. })
        ));
        assert_eq!(
            prepare_control(&points, PointId(99), &PointValue::Digital(0)),
            Err(BridgeError::UnknownPoint(PointId(99)))
        );
    }
}
