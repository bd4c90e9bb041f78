//! Concrete banking events.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{Event, EventType, RoutedEvent};

/// Schema version stamped on every new event.
pub const EVENT_VERSION: &str = "1.0";

/// Fields shared by every catalog event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    pub source: String,
}

impl BaseEvent {
    pub fn new(event_type: EventType, source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            version: EVENT_VERSION.to_string(),
            correlation_id: None,
            causation_id: None,
            source: source.into(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }
}

/// Context about where an event originated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiation_method: Option<String>,
}

/// Published when a transfer is initiated. Keyed by user so all transfers of
/// one user stay ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionInitiated {
    #[serde(flatten)]
    pub base: BaseEvent,
    pub transaction_id: Uuid,
    pub user_id: Uuid,
    pub from_account_id: Uuid,
    pub to_account_id: Uuid,
    /// Carried on the wire as a decimal string, e.g. `"100.50"`.
    pub amount: Decimal,
    pub currency: String,
    pub transfer_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl Event for TransactionInitiated {
    fn key(&self) -> String {
        self.user_id.to_string()
    }
}

impl RoutedEvent for TransactionInitiated {
    fn event_type(&self) -> EventType {
        self.base.event_type
    }
}

/// Published when a transaction settles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionCompleted {
    #[serde(flatten)]
    pub base: BaseEvent,
    pub transaction_id: Uuid,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    #[serde(rename = "processing_time_ms")]
    pub processing_time: i64,
}

impl Event for TransactionCompleted {
    fn key(&self) -> String {
        self.transaction_id.to_string()
    }
}

impl RoutedEvent for TransactionCompleted {
    fn event_type(&self) -> EventType {
        self.base.event_type
    }
}

/// Outcome of fraud scoring for a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudAnalysisComplete {
    #[serde(flatten)]
    pub base: BaseEvent,
    pub transaction_id: Uuid,
    pub user_id: Uuid,
    pub analysis_id: String,
    pub risk_score: f64,
    /// `APPROVED`, `REJECTED` or `REVIEW_REQUIRED`.
    pub decision: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    pub processing_ms: i64,
}

impl Event for FraudAnalysisComplete {
    fn key(&self) -> String {
        self.transaction_id.to_string()
    }
}

impl RoutedEvent for FraudAnalysisComplete {
    fn event_type(&self) -> EventType {
        self.base.event_type
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCreated {
    #[serde(flatten)]
    pub base: BaseEvent,
    pub user_id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub tier: String,
}

impl Event for UserCreated {
    fn key(&self) -> String {
        self.user_id.to_string()
    }
}

impl RoutedEvent for UserCreated {
    fn event_type(&self) -> EventType {
        self.base.event_type
    }
}

/// Audit trail entry, keyed by the acting principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    #[serde(flatten)]
    pub base: BaseEvent,
    pub actor_id: String,
    /// `user`, `system` or `admin`.
    pub actor_type: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

impl Event for AuditLog {
    fn key(&self) -> String {
        self.actor_id.clone()
    }
}

impl RoutedEvent for AuditLog {
    fn event_type(&self) -> EventType {
        self.base.event_type
    }
}
