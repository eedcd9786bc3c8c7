use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

/// EventType identifies the kind of object an event refers to.
/// Values must match `EventRecord.Type` in the scheduler interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum EventType {
    Unknown = 0,
    Request = 1,
    App = 2,
    Node = 3,
    Queue = 4,
    UserGroup = 5,
}

impl EventType {
    /// Returns the canonical enumerant name used in event keys.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN_EVENTRECORD_TYPE",
            Self::Request => "REQUEST",
            Self::App => "APP",
            Self::Node => "NODE",
            Self::Queue => "QUEUE",
            Self::UserGroup => "USERGROUP",
        }
    }

    /// Convert from the raw wire value.
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Unknown),
            1 => Some(Self::Request),
            2 => Some(Self::App),
            3 => Some(Self::Node),
            4 => Some(Self::Queue),
            5 => Some(Self::UserGroup),
            _ => None,
        }
    }

    /// Convert from the canonical enumerant name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|t| t.as_str() == name)
    }

    /// Return all event types in numeric order.
    pub fn all() -> &'static [Self] {
        &[
            Self::Unknown,
            Self::Request,
            Self::App,
            Self::Node,
            Self::Queue,
            Self::UserGroup,
        ]
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ChangeType is the operation an event applies to its object.
/// Values must match `EventRecord.ChangeType` in the scheduler interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(i32)]
pub enum ChangeType {
    #[default]
    None = 0,
    Set = 1,
    Add = 2,
    Remove = 3,
}

impl ChangeType {
    /// Returns the canonical enumerant name used in event keys.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Set => "SET",
            Self::Add => "ADD",
            Self::Remove => "REMOVE",
        }
    }

    /// Convert from the raw wire value.
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Set),
            2 => Some(Self::Add),
            3 => Some(Self::Remove),
            _ => None,
        }
    }

    /// Convert from the canonical enumerant name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|t| t.as_str() == name)
    }

    /// Return all change types in numeric order.
    pub fn all() -> &'static [Self] {
        &[Self::None, Self::Set, Self::Add, Self::Remove]
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finer-grained reason attached to an event. Kept as the raw wire value so
/// details added by newer schedulers still decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChangeDetail(pub i32);

/// Known change details and their canonical names.
const CHANGE_DETAIL_NAMES: &[(i32, &str)] = &[
    (0, "DETAILS_NONE"),
    (100, "REQUEST_CANCEL"),
    (101, "REQUEST_ALLOC"),
    (102, "REQUEST_TIMEOUT"),
    (200, "APP_ALLOC"),
    (201, "APP_REQUEST"),
    (202, "APP_REJECT"),
    (203, "APP_NEW"),
    (204, "APP_ACCEPTED"),
    (206, "APP_RUNNING"),
    (207, "APP_COMPLETING"),
    (208, "APP_COMPLETED"),
    (209, "APP_FAILING"),
    (210, "APP_FAILED"),
    (211, "APP_RESUMING"),
    (212, "APP_EXPIRED"),
    (213, "APP_CANNOTRUN_QUOTA"),
    (214, "APP_RUNNABLE_QUOTA"),
    (300, "NODE_DECOMISSION"),
    (301, "NODE_READY"),
    (302, "NODE_SCHEDULABLE"),
    (303, "NODE_ALLOC"),
    (304, "NODE_CAPACITY"),
    (305, "NODE_OCCUPIED"),
    (306, "NODE_RESERVATION"),
    (400, "QUEUE_CONFIG"),
    (401, "QUEUE_DYNAMIC"),
    (402, "QUEUE_TYPE"),
    (403, "QUEUE_MAX"),
    (404, "QUEUE_GUARANTEED"),
    (500, "ALLOC_CANCEL"),
    (501, "ALLOC_PREEMPT"),
    (502, "ALLOC_TIMEOUT"),
    (503, "ALLOC_REPLACED"),
    (504, "ALLOC_NODEREMOVED"),
];

impl ChangeDetail {
    /// Canonical name, if the detail is known.
    pub fn name(self) -> Option<&'static str> {
        CHANGE_DETAIL_NAMES
            .iter()
            .find(|(v, _)| *v == self.0)
            .map(|(_, n)| *n)
    }

    fn from_name(name: &str) -> Option<Self> {
        CHANGE_DETAIL_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(v, _)| Self(*v))
    }

    /// Application state implied by a terminal application detail.
    pub fn terminal_app_state(self) -> Option<&'static str> {
        match self.0 {
            202 => Some("Rejected"),
            208 => Some("Completed"),
            210 => Some("Failed"),
            212 => Some("Expired"),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{}", self.0),
        }
    }
}

/// A single resource quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Quantity {
    #[serde(default)]
    pub value: i64,
}

/// Resource vector attached to an event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub resources: BTreeMap<String, Quantity>,
}

/// One decoded record from the scheduler event stream.
///
/// Zero-valued fields are omitted on the wire, so every field defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    #[serde(
        rename = "type",
        default,
        deserialize_with = "de_event_type",
        serialize_with = "ser_event_type"
    )]
    pub event_type: EventType,
    #[serde(
        default,
        deserialize_with = "de_change_type",
        serialize_with = "ser_change_type"
    )]
    pub event_change_type: ChangeType,
    #[serde(
        default,
        deserialize_with = "de_change_detail",
        serialize_with = "ser_change_detail"
    )]
    pub event_change_detail: ChangeDetail,
    #[serde(rename = "objectID", default, skip_serializing_if = "String::is_empty")]
    pub object_id: String,
    #[serde(rename = "referenceID", default, skip_serializing_if = "String::is_empty")]
    pub reference_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default)]
    pub timestamp_nano: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Resource>,
}

impl Default for EventType {
    fn default() -> Self {
        Self::Unknown
    }
}

impl EventRecord {
    /// Creates a bare record of the given type and change.
    pub fn new(event_type: EventType, change_type: ChangeType) -> Self {
        Self {
            event_type,
            event_change_type: change_type,
            ..Default::default()
        }
    }

    /// Aggregation identity of this record.
    pub fn key(&self) -> EventKey {
        EventKey {
            event_type: self.event_type,
            change_type: self.event_change_type,
        }
    }
}

/// The `(type, changeType)` pair events are counted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    pub event_type: EventType,
    pub change_type: ChangeType,
}

impl EventKey {
    pub const fn new(event_type: EventType, change_type: ChangeType) -> Self {
        Self {
            event_type,
            change_type,
        }
    }
}

/// Formats as `"<Type>-<ChangeType>"`, e.g. `APP-ADD`.
impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.event_type, self.change_type)
    }
}

// --- Enum wire encoding: numeric or canonical name ---

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEnum {
    Number(i64),
    Name(String),
}

fn raw_to_i32<E: de::Error>(n: i64, what: &str) -> Result<i32, E> {
    i32::try_from(n).map_err(|_| E::custom(format!("{what} out of range: {n}")))
}

fn de_event_type<'de, D: Deserializer<'de>>(d: D) -> Result<EventType, D::Error> {
    match RawEnum::deserialize(d)? {
        RawEnum::Number(n) => {
            let v = raw_to_i32(n, "event type")?;
            EventType::from_i32(v)
                .ok_or_else(|| de::Error::custom(format!("unknown event type: {v}")))
        }
        RawEnum::Name(s) => EventType::from_name(&s)
            .ok_or_else(|| de::Error::custom(format!("unknown event type: {s:?}"))),
    }
}

fn de_change_type<'de, D: Deserializer<'de>>(d: D) -> Result<ChangeType, D::Error> {
    match RawEnum::deserialize(d)? {
        RawEnum::Number(n) => {
            let v = raw_to_i32(n, "change type")?;
            ChangeType::from_i32(v)
                .ok_or_else(|| de::Error::custom(format!("unknown change type: {v}")))
        }
        RawEnum::Name(s) => ChangeType::from_name(&s)
            .ok_or_else(|| de::Error::custom(format!("unknown change type: {s:?}"))),
    }
}

fn de_change_detail<'de, D: Deserializer<'de>>(d: D) -> Result<ChangeDetail, D::Error> {
    match RawEnum::deserialize(d)? {
        RawEnum::Number(n) => Ok(ChangeDetail(raw_to_i32(n, "change detail")?)),
        RawEnum::Name(s) => ChangeDetail::from_name(&s)
            .ok_or_else(|| de::Error::custom(format!("unknown change detail: {s:?}"))),
    }
}

fn ser_event_type<S: Serializer>(v: &EventType, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_i32(*v as i32)
}

fn ser_change_type<S: Serializer>(v: &ChangeType, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_i32(*v as i32)
}

fn ser_change_detail<S: Serializer>(v: &ChangeDetail, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_i32(v.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_uses_canonical_names() {
        let ev = EventRecord::new(EventType::App, ChangeType::Add);
        assert_eq!(ev.key().to_string(), "APP-ADD");
        assert_eq!(
            EventKey::new(EventType::UserGroup, ChangeType::Remove).to_string(),
            "USERGROUP-REMOVE"
        );
    }

    #[test]
    fn test_decode_numeric_enums() {
        let ev: EventRecord =
            serde_json::from_str(r#"{"type": 2, "eventChangeType": 2}"#).expect("decode");
        assert_eq!(ev.event_type, EventType::App);
        assert_eq!(ev.event_change_type, ChangeType::Add);
        assert_eq!(ev.event_change_detail, ChangeDetail(0));
    }

    #[test]
    fn test_decode_named_enums_and_fields() {
        let ev: EventRecord = serde_json::from_str(
            r#"{"type":"NODE","eventChangeType":"REMOVE","eventChangeDetail":"NODE_DECOMISSION",
                "objectID":"node-1","referenceID":"","message":"gone","timestampNano":42,
                "resource":{"resources":{"memory":{"value":1024}}}}"#,
        )
        .expect("decode");
        assert_eq!(ev.event_type, EventType::Node);
        assert_eq!(ev.event_change_type, ChangeType::Remove);
        assert_eq!(ev.event_change_detail.name(), Some("NODE_DECOMISSION"));
        assert_eq!(ev.object_id, "node-1");
        assert_eq!(ev.timestamp_nano, 42);
        let res = ev.resource.expect("resource");
        assert_eq!(res.resources["memory"].value, 1024);
    }

    #[test]
    fn test_omitted_fields_default_to_zero_values() {
        let ev: EventRecord = serde_json::from_str("{}").expect("decode");
        assert_eq!(ev.key().to_string(), "UNKNOWN_EVENTRECORD_TYPE-NONE");
    }

    #[test]
    fn test_unknown_enum_values_rejected() {
        assert!(serde_json::from_str::<EventRecord>(r#"{"type": 99}"#).is_err());
        assert!(serde_json::from_str::<EventRecord>(r#"{"type": "BOGUS"}"#).is_err());
        assert!(serde_json::from_str::<EventRecord>(r#"{"eventChangeType": 7}"#).is_err());
    }

    #[test]
    fn test_unknown_change_detail_kept_raw() {
        let ev: EventRecord =
            serde_json::from_str(r#"{"type": 2, "eventChangeDetail": 999}"#).expect("decode");
        assert_eq!(ev.event_change_detail.to_string(), "999");
        assert_eq!(ev.event_change_detail.name(), None);
    }

    #[test]
    fn test_encode_matches_wire_shape() {
        let ev = EventRecord::new(EventType::App, ChangeType::Set);
        let json = serde_json::to_value(&ev).expect("encode");
        assert_eq!(json["type"], 2);
        assert_eq!(json["eventChangeType"], 1);
        assert!(json.get("objectID").is_none());
    }

    #[test]
    fn test_terminal_app_state() {
        assert_eq!(ChangeDetail(208).terminal_app_state(), Some("Completed"));
        assert_eq!(ChangeDetail(206).terminal_app_state(), None);
    }
}
