//! Wire format of the live channel.
//!
//! Every frame is a JSON object `{ "type": ..., "payload"?: {...}, ...fields }`.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::GeoPoint;

/// Delivery ids arrive as numbers from some endpoints and strings from others.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeliveryId {
    Number(i64),
    Text(String),
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryId::Number(n) => write!(f, "{}", n),
            DeliveryId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for DeliveryId {
    fn from(id: i64) -> Self {
        DeliveryId::Number(id)
    }
}

impl From<&str> for DeliveryId {
    fn from(id: &str) -> Self {
        DeliveryId::Text(id.to_string())
    }
}

impl From<String> for DeliveryId {
    fn from(id: String) -> Self {
        DeliveryId::Text(id)
    }
}

/// Delivery lifecycle status as the backend spells it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeliveryStatus {
    Assigned,
    PickedUp,
    InTransit,
    Delivered,
    Other(String),
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &str {
        match self {
            DeliveryStatus::Assigned => "assigned",
            DeliveryStatus::PickedUp => "picked_up",
            DeliveryStatus::InTransit => "in_transit",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Other(s) => s,
        }
    }
}

impl From<String> for DeliveryStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "assigned" => DeliveryStatus::Assigned,
            "picked_up" => DeliveryStatus::PickedUp,
            "in_transit" => DeliveryStatus::InTransit,
            "delivered" => DeliveryStatus::Delivered,
            _ => DeliveryStatus::Other(s),
        }
    }
}

impl From<DeliveryStatus> for String {
    fn from(status: DeliveryStatus) -> Self {
        status.as_str().to_string()
    }
}

/// ISO-8601 UTC timestamp with millisecond precision.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationPayload {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckedInPayload {
    pub checked_in: bool,
}

/// Frames the courier sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Authorization {
        token: String,
    },
    LocationUpdate {
        latitude: f64,
        longitude: f64,
        timestamp: String,
    },
    LocationResponse {
        payload: LocationPayload,
    },
    LocationError {
        payload: LocationErrorPayload,
    },
    StatusUpdate {
        delivery_id: DeliveryId,
        status: DeliveryStatus,
    },
    CheckedIn {
        payload: CheckedInPayload,
    },
}

pub const LOCATION_UNAVAILABLE: &str = "location_unavailable";

impl OutboundMessage {
    pub fn authorization(token: impl Into<String>) -> Self {
        OutboundMessage::Authorization {
            token: token.into(),
        }
    }

    pub fn location_update(position: GeoPoint) -> Self {
        OutboundMessage::LocationUpdate {
            latitude: position.latitude,
            longitude: position.longitude,
            timestamp: timestamp_now(),
        }
    }

    pub fn location_response(position: GeoPoint, request_id: Option<Value>) -> Self {
        OutboundMessage::LocationResponse {
            payload: LocationPayload {
                latitude: position.latitude,
                longitude: position.longitude,
                timestamp: timestamp_now(),
                request_id,
            },
        }
    }

    pub fn location_unavailable(request_id: Option<Value>) -> Self {
        OutboundMessage::LocationError {
            payload: LocationErrorPayload {
                request_id,
                error: LOCATION_UNAVAILABLE.to_string(),
            },
        }
    }

    pub fn status_update(delivery_id: DeliveryId, status: DeliveryStatus) -> Self {
        OutboundMessage::StatusUpdate {
            delivery_id,
            status,
        }
    }

    pub fn checked_in() -> Self {
        OutboundMessage::CheckedIn {
            payload: CheckedInPayload { checked_in: true },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Authorization { .. } => "authorization",
            OutboundMessage::LocationUpdate { .. } => "location_update",
            OutboundMessage::LocationResponse { .. } => "location_response",
            OutboundMessage::LocationError { .. } => "location_error",
            OutboundMessage::StatusUpdate { .. } => "status_update",
            OutboundMessage::CheckedIn { .. } => "checked_in",
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A delivery record pulled out of an assignment push.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: DeliveryId,
    pub status: Option<DeliveryStatus>,
    /// Everything else the backend sent for this delivery.
    pub fields: Map<String, Value>,
}

impl Delivery {
    fn from_value(value: &Value) -> Option<Self> {
        let mut fields = value.as_object()?.clone();
        let id = serde_json::from_value(fields.remove("id")?).ok()?;
        let status = fields
            .remove("status")
            .and_then(|s| s.as_str().map(|s| DeliveryStatus::from(s.to_string())));
        Some(Self { id, status, fields })
    }
}

const DELIVERY_KINDS: [&str; 3] = ["order_assigned", "delivery_assigned", "current_deliveries"];

/// Any frame the backend sends. Unknown kinds are kept as-is for observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl InboundMessage {
    pub fn parse(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn is_location_request(&self) -> bool {
        self.kind == "location_request"
    }

    /// `payload.request_id`, or a top-level `request_id`.
    pub fn request_id(&self) -> Option<Value> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("request_id"))
            .or_else(|| self.fields.get("request_id"))
            .filter(|v| !v.is_null())
            .cloned()
    }

    /// Deliveries carried by an assignment push. Accepts the payload as a
    /// single delivery, `{delivery: {...}}`, `{deliveries: [...]}` or a bare
    /// array. Records without an `id` are skipped.
    pub fn deliveries(&self) -> Vec<Delivery> {
        if !DELIVERY_KINDS.contains(&self.kind.as_str()) {
            return Vec::new();
        }

        let fallback = Value::Object(self.fields.clone());
        let body = self.payload.as_ref().unwrap_or(&fallback);

        let records: Vec<&Value> = match body {
            Value::Array(items) => items.iter().collect(),
            Value::Object(map) => match (map.get("deliveries"), map.get("delivery")) {
                (Some(Value::Array(items)), _) => items.iter().collect(),
                (_, Some(single)) => vec![single],
                _ => vec![body],
            },
            _ => Vec::new(),
        };

        records.into_iter().filter_map(Delivery::from_value).collect()
    }

    /// The frame as the JSON object it was received as.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
