//! Event types and their topic routing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of a banking event. Serialized as its catalog name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    TransactionInitiated,
    TransactionAnalyzing,
    TransactionApproved,
    TransactionRejected,
    TransactionCompleted,
    TransactionFailed,
    TransactionCancelled,
    TransactionWaitingReview,

    FraudAnalysisComplete,
    FraudSuspected,
    FraudReviewComplete,
    ManualReviewRequired,
    BlocklistMatch,

    UserCreated,
    UserUpdated,
    UserLocked,
    UserPasswordChanged,

    LoginSuccess,
    LoginFailed,
    #[serde(rename = "MFAEnabled")]
    MfaEnabled,
    TokenRevoked,
    #[serde(rename = "JWTKeyRotated")]
    JwtKeyRotated,
    SecurityAlert,

    NotificationSent,
    NotificationFailed,

    #[serde(rename = "AMLScreeningComplete")]
    AmlScreeningComplete,
    #[serde(rename = "SARFiled")]
    SarFiled,
    RiskProfileUpdated,

    AuditLogCreated,
}

impl EventType {
    /// Catalog name of the event type, identical to its serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransactionInitiated => "TransactionInitiated",
            Self::TransactionAnalyzing => "TransactionAnalyzing",
            Self::TransactionApproved => "TransactionApproved",
            Self::TransactionRejected => "TransactionRejected",
            Self::TransactionCompleted => "TransactionCompleted",
            Self::TransactionFailed => "TransactionFailed",
            Self::TransactionCancelled => "TransactionCancelled",
            Self::TransactionWaitingReview => "TransactionWaitingReview",
            Self::FraudAnalysisComplete => "FraudAnalysisComplete",
            Self::FraudSuspected => "FraudSuspected",
            Self::FraudReviewComplete => "FraudReviewComplete",
            Self::ManualReviewRequired => "ManualReviewRequired",
            Self::BlocklistMatch => "BlocklistMatch",
            Self::UserCreated => "UserCreated",
            Self::UserUpdated => "UserUpdated",
            Self::UserLocked => "UserLocked",
            Self::UserPasswordChanged => "UserPasswordChanged",
            Self::LoginSuccess => "LoginSuccess",
            Self::LoginFailed => "LoginFailed",
            Self::MfaEnabled => "MFAEnabled",
            Self::TokenRevoked => "TokenRevoked",
            Self::JwtKeyRotated => "JWTKeyRotated",
            Self::SecurityAlert => "SecurityAlert",
            Self::NotificationSent => "NotificationSent",
            Self::NotificationFailed => "NotificationFailed",
            Self::AmlScreeningComplete => "AMLScreeningComplete",
            Self::SarFiled => "SARFiled",
            Self::RiskProfileUpdated => "RiskProfileUpdated",
            Self::AuditLogCreated => "AuditLogCreated",
        }
    }

    /// Returns the topic this event type is published to.
    ///
    /// Types without a dedicated topic go to the audit log.
    pub fn topic<'a>(&self, cfg: &'a TopicConfig) -> &'a str {
        match self {
            Self::TransactionInitiated => &cfg.transaction_initiated,
            Self::TransactionApproved => &cfg.transaction_approved,
            Self::TransactionRejected => &cfg.transaction_rejected,
            Self::TransactionCompleted => &cfg.transaction_completed,
            Self::FraudAnalysisComplete | Self::FraudReviewComplete => &cfg.fraud_analysis,
            Self::FraudSuspected | Self::BlocklistMatch => &cfg.fraud_suspected,
            Self::ManualReviewRequired => &cfg.manual_review,
            Self::UserCreated | Self::UserUpdated | Self::UserLocked => &cfg.user_events,
            Self::LoginSuccess | Self::LoginFailed | Self::SecurityAlert | Self::JwtKeyRotated => {
                &cfg.security_events
            }
            Self::NotificationSent | Self::NotificationFailed => &cfg.notifications,
            Self::AmlScreeningComplete | Self::RiskProfileUpdated => &cfg.aml_screening,
            Self::SarFiled => &cfg.sar_filing,
            _ => &cfg.audit_log,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kafka topic names for the banking platform.
///
/// Every field has a default, so a partial config file only needs to name the
/// topics it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub transaction_initiated: String,
    pub transaction_approved: String,
    pub transaction_rejected: String,
    pub transaction_completed: String,

    pub fraud_analysis: String,
    pub fraud_suspected: String,
    pub manual_review: String,

    pub user_events: String,
    pub security_events: String,
    pub notifications: String,

    pub aml_screening: String,
    pub sar_filing: String,

    pub audit_log: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            transaction_initiated: "banking.transactions.initiated".to_string(),
            transaction_approved: "banking.transactions.approved".to_string(),
            transaction_rejected: "banking.transactions.rejected".to_string(),
            transaction_completed: "banking.transactions.completed".to_string(),
            fraud_analysis: "banking.fraud.analysis".to_string(),
            fraud_suspected: "banking.fraud.suspected".to_string(),
            manual_review: "banking.fraud.manual-review".to_string(),
            user_events: "banking.users.events".to_string(),
            security_events: "banking.security.events".to_string(),
            notifications: "banking.notifications".to_string(),
            aml_screening: "banking.aml.screening".to_string(),
            sar_filing: "banking.aml.sar-filing".to_string(),
            audit_log: "banking.audit.log".to_string(),
        }
    }
}

impl TopicConfig {
    /// All distinct topic names, e.g. for a consumer that audits every stream.
    pub fn all(&self) -> Vec<&str> {
        let mut topics = vec![
            self.transaction_initiated.as_str(),
            self.transaction_approved.as_str(),
            self.transaction_rejected.as_str(),
            self.transaction_completed.as_str(),
            self.fraud_analysis.as_str(),
            self.fraud_suspected.as_str(),
            self.manual_review.as_str(),
            self.user_events.as_str(),
            self.security_events.as_str(),
            self.notifications.as_str(),
            self.aml_screening.as_str(),
            self.sar_filing.as_str(),
            self.audit_log.as_str(),
        ];
        topics.sort_unstable();
        topics.dedup();
        topics
    }
}
