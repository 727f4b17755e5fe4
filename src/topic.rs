//! Topic construction and parsing for workitem events.
//!
//! Topics tie workitem identity to bus addressing:
//! - `/workitems` is the global subscription target
//! - `/workitems/<uid>/<subtopic>` carries a workitem-scoped event, with
//!   `subtopic` being `state` or `cancelrequest`
//! - subscription filters append the MQTT wildcard suffix `/#`
//!
//! Parsing is strict: only the three-segment workitem form decodes; any
//! other shape is surfaced as a [`TopicError`] carrying the raw segments
//! so callers can log and drop the message.

use std::fmt;

/// Default topic base for workitem events.
pub const DEFAULT_TOPIC_PREFIX: &str = "/workitems";

/// Workitem event subtopic, mapped to the DIMSE event type id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subtopic {
    /// UPS State Report (event type 1).
    State,
    /// UPS Cancel Request (event type 2).
    CancelRequest,
}

impl Subtopic {
    /// Topic segment text.
    pub fn as_str(&self) -> &'static str {
        match self {
            Subtopic::State => "state",
            Subtopic::CancelRequest => "cancelrequest",
        }
    }

    /// DIMSE event type id carried by N-EVENT-REPORT.
    pub fn event_type_id(&self) -> u16 {
        match self {
            Subtopic::State => 1,
            Subtopic::CancelRequest => 2,
        }
    }

    /// Map an event type id to a subtopic. Ids other than 1 and 2 have no
    /// bus representation.
    pub fn from_event_type_id(id: u16) -> Option<Self> {
        match id {
            1 => Some(Subtopic::State),
            2 => Some(Subtopic::CancelRequest),
            _ => None,
        }
    }

    fn parse(segment: &str) -> Option<Self> {
        match segment {
            "state" => Some(Subtopic::State),
            "cancelrequest" => Some(Subtopic::CancelRequest),
            _ => None,
        }
    }
}

impl fmt::Display for Subtopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded workitem event topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkitemTopic {
    /// Workitem (SOP instance) UID.
    pub uid: String,
    /// Event subtopic.
    pub subtopic: Subtopic,
}

/// Errors from strict topic decoding.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TopicError {
    #[error("topic does not match {prefix}/<uid>/<subtopic>: {segments:?}")]
    Shape {
        prefix: String,
        segments: Vec<String>,
    },

    #[error("unknown workitem subtopic '{value}' in {segments:?}")]
    UnknownSubtopic {
        value: String,
        segments: Vec<String>,
    },
}

impl TopicError {
    /// Raw segments of the offending topic, for logging.
    pub fn segments(&self) -> &[String] {
        match self {
            TopicError::Shape { segments, .. } => segments,
            TopicError::UnknownSubtopic { segments, .. } => segments,
        }
    }
}

/// Stateless codec mapping workitem identity to bus topics and back.
#[derive(Debug, Clone)]
pub struct TopicCodec {
    prefix: String,
}

impl Default for TopicCodec {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_TOPIC_PREFIX)
    }
}

impl TopicCodec {
    /// Create a codec with a custom topic base (default `/workitems`).
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Global subscription target (no workitem id).
    pub fn global(&self) -> String {
        self.prefix.clone()
    }

    /// Scope topic for one workitem, without a subtopic.
    pub fn workitem_scope(&self, uid: &str) -> String {
        format!("{}/{}", self.prefix, uid)
    }

    /// Publish topic for one workitem event.
    pub fn workitem(&self, uid: &str, subtopic: Subtopic) -> String {
        format!("{}/{}/{}", self.prefix, uid, subtopic)
    }

    /// Subscription filter with the wildcard suffix.
    ///
    /// `None` yields the default filter over the whole topic base.
    pub fn filter(&self, topic: Option<&str>) -> String {
        match topic {
            Some(topic) => format!("{}/#", topic.trim_end_matches('/')),
            None => format!("{}/#", self.prefix),
        }
    }

    /// Strictly parse a workitem event topic.
    pub fn decode(&self, topic: &str) -> Result<WorkitemTopic, TopicError> {
        let segments: Vec<String> = topic.split('/').map(str::to_string).collect();
        let prefix_segments: Vec<&str> = self.prefix.split('/').collect();

        let matches_prefix = segments.len() == prefix_segments.len() + 2
            && segments
                .iter()
                .zip(prefix_segments.iter())
                .all(|(a, b)| a == b);
        if !matches_prefix {
            return Err(TopicError::Shape {
                prefix: self.prefix.clone(),
                segments,
            });
        }

        let uid = segments[prefix_segments.len()].clone();
        let subtopic_segment = &segments[prefix_segments.len() + 1];
        let subtopic = match Subtopic::parse(subtopic_segment) {
            Some(subtopic) => subtopic,
            None => {
                return Err(TopicError::UnknownSubtopic {
                    value: subtopic_segment.clone(),
                    segments,
                })
            }
        };
        if uid.is_empty() {
            return Err(TopicError::Shape {
                prefix: self.prefix.clone(),
                segments,
            });
        }

        Ok(WorkitemTopic { uid, subtopic })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_workitem_topics() {
        let codec = TopicCodec::default();
        assert_eq!(
            codec.workitem("1.2.3.4", Subtopic::State),
            "/workitems/1.2.3.4/state"
        );
        assert_eq!(
            codec.workitem("1.2.3.4", Subtopic::CancelRequest),
            "/workitems/1.2.3.4/cancelrequest"
        );
        assert_eq!(codec.global(), "/workitems");
        assert_eq!(codec.workitem_scope("5.6.7"), "/workitems/5.6.7");
    }

    #[test]
    fn test_filter_appends_wildcard() {
        let codec = TopicCodec::default();
        assert_eq!(codec.filter(None), "/workitems/#");
        assert_eq!(
            codec.filter(Some("/workitems/1.2.3.4")),
            "/workitems/1.2.3.4/#"
        );
    }

    #[test]
    fn test_decode_encode_round_trip() {
        let codec = TopicCodec::default();
        for subtopic in [Subtopic::State, Subtopic::CancelRequest] {
            let topic = codec.workitem("1.2.840.99.7", subtopic);
            let decoded = codec.decode(&topic).unwrap();
            assert_eq!(decoded.uid, "1.2.840.99.7");
            assert_eq!(decoded.subtopic, subtopic);
        }
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        let codec = TopicCodec::default();
        let err = codec.decode("/invalid/topic").unwrap_err();
        assert_eq!(err.segments(), &["", "invalid", "topic"]);

        assert!(codec.decode("/workitems").is_err());
        assert!(codec.decode("/workitems/1.2.3.4").is_err());
        assert!(codec.decode("/workitems/1.2.3.4/state/extra").is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_subtopic() {
        let codec = TopicCodec::default();
        let err = codec.decode("/workitems/1.2.3.4/progress").unwrap_err();
        match err {
            TopicError::UnknownSubtopic { value, .. } => assert_eq!(value, "progress"),
            other => panic!("expected UnknownSubtopic, got {other:?}"),
        }
    }

    #[test]
    fn test_custom_prefix() {
        let codec = TopicCodec::with_prefix("/site1/workitems");
        let topic = codec.workitem("1.2", Subtopic::State);
        assert_eq!(topic, "/site1/workitems/1.2/state");
        let decoded = codec.decode(&topic).unwrap();
        assert_eq!(decoded.uid, "1.2");
    }

    #[test]
    fn test_subtopic_event_type_mapping() {
        assert_eq!(Subtopic::from_event_type_id(1), Some(Subtopic::State));
        assert_eq!(
            Subtopic::from_event_type_id(2),
            Some(Subtopic::CancelRequest)
        );
        assert_eq!(Subtopic::from_event_type_id(3), None);
        assert_eq!(Subtopic::State.event_type_id(), 1);
        assert_eq!(Subtopic::CancelRequest.event_type_id(), 2);
    }
}
