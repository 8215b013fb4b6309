//! Domain event types.
//!
//! All events use past-tense naming (facts that happened). Every event
//! carries a tenant id for isolation. The payload is a closed sum type:
//! a handler registered for one event type can only ever observe that
//! type's payload shape.
//!
//! Payload shapes are versioned additively. Never repurpose an existing
//! variant's fields; add a new variant instead.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An immutable domain event, constructed once and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub tenant_id: Uuid,
    pub initiated_by: Option<Uuid>,
    pub payload: EventPayload,
}

impl DomainEvent {
    /// Construct a new event with a fresh id and the current timestamp.
    pub fn new(tenant_id: Uuid, payload: EventPayload, initiated_by: Option<Uuid>) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            occurred_at: Utc::now(),
            tenant_id,
            initiated_by,
            payload,
        }
    }

    /// The past-tense event type tag, e.g. `"PaymentReconciled"`.
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentReceived {
    pub payment_id: Uuid,
    pub bank_account_id: Option<Uuid>,
    /// Amount in minor currency units.
    pub amount: i64,
    pub transaction_ref: Option<String>,
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentReconciled {
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    pub student_id: Uuid,
    pub campus_id: Uuid,
    pub amount: i64,
    pub invoice_status: String,
    pub new_paid_amount: i64,
    pub ledger_entry_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentReversed {
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    pub student_id: Uuid,
    pub amount: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceIssued {
    pub invoice_id: Uuid,
    pub student_id: Uuid,
    pub campus_id: Uuid,
    pub total_amount: i64,
    pub due_date: NaiveDate,
    pub invoice_no: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentEnrolled {
    pub enrollment_id: Uuid,
    pub student_id: Uuid,
    pub campus_id: Uuid,
    pub academic_year_id: Uuid,
    pub class_id: Uuid,
    pub section_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromotionAction {
    Promoted,
    Retained,
    Graduated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentPromoted {
    pub enrollment_id: Uuid,
    pub student_id: Uuid,
    pub campus_id: Uuid,
    pub from_academic_year_id: Uuid,
    pub to_academic_year_id: Uuid,
    pub from_class_id: Uuid,
    pub to_class_id: Uuid,
    pub action: PromotionAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentWithdrawn {
    pub enrollment_id: Uuid,
    pub student_id: Uuid,
    pub campus_id: Uuid,
    pub academic_year_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionRunCompleted {
    pub promotion_run_id: Uuid,
    pub from_academic_year_id: Uuid,
    pub to_academic_year_id: Uuid,
    pub total_students: i64,
    pub promoted: i64,
    pub retained: i64,
    pub graduated: i64,
    pub errors: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderSent {
    pub student_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub channel: String,
    pub trigger: String,
    pub rule_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportGenerated {
    pub job_id: Uuid,
    pub report_type: String,
    pub result_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailed {
    pub job_id: Uuid,
    pub job_type: String,
    pub queue: String,
    pub error: String,
    pub attempts: i32,
}

// ============================================================================
// Sum type
// ============================================================================

/// Closed set of domain event payloads, tagged by event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "data")]
pub enum EventPayload {
    PaymentReceived(PaymentReceived),
    PaymentReconciled(PaymentReconciled),
    PaymentReversed(PaymentReversed),
    InvoiceIssued(InvoiceIssued),
    StudentEnrolled(StudentEnrolled),
    StudentPromoted(StudentPromoted),
    StudentWithdrawn(StudentWithdrawn),
    PromotionRunCompleted(PromotionRunCompleted),
    ReminderSent(ReminderSent),
    ReportGenerated(ReportGenerated),
    JobFailed(JobFailed),
}

/// A payload struct that corresponds to exactly one [`EventPayload`] variant.
///
/// Implemented for every payload type so handlers can be registered with a
/// concrete payload parameter instead of matching on the enum themselves.
pub trait EventKind: Sized {
    const EVENT_TYPE: &'static str;

    fn extract(payload: &EventPayload) -> Option<&Self>;
}

macro_rules! event_kinds {
    ($($variant:ident),+ $(,)?) => {
        impl EventPayload {
            /// The event type tag for this payload.
            pub fn event_type(&self) -> &'static str {
                match self {
                    $(EventPayload::$variant(_) => stringify!($variant),)+
                }
            }
        }

        $(
            impl EventKind for $variant {
                const EVENT_TYPE: &'static str = stringify!($variant);

                fn extract(payload: &EventPayload) -> Option<&Self> {
                    match payload {
                        EventPayload::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }
            }

            impl From<$variant> for EventPayload {
                fn from(payload: $variant) -> Self {
                    EventPayload::$variant(payload)
                }
            }
        )+
    };
}

event_kinds!(
    PaymentReceived,
    PaymentReconciled,
    PaymentReversed,
    InvoiceIssued,
    StudentEnrolled,
    StudentPromoted,
    StudentWithdrawn,
    PromotionRunCompleted,
    ReminderSent,
    ReportGenerated,
    JobFailed,
);

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_enrollment() -> EventPayload {
        EventPayload::StudentEnrolled(StudentEnrolled {
            enrollment_id: Uuid::now_v7(),
            student_id: Uuid::now_v7(),
            campus_id: Uuid::now_v7(),
            academic_year_id: Uuid::now_v7(),
            class_id: Uuid::now_v7(),
            section_id: None,
        })
    }

    #[test]
    fn event_type_matches_variant_name() {
        assert_eq!(sample_enrollment().event_type(), "StudentEnrolled");
        assert_eq!(StudentEnrolled::EVENT_TYPE, "StudentEnrolled");
    }

    #[test]
    fn payload_serializes_with_event_type_tag() {
        let json = serde_json::to_value(sample_enrollment()).unwrap();
        assert_eq!(json["eventType"], "StudentEnrolled");
        assert!(json["data"]["enrollment_id"].is_string());
    }

    #[test]
    fn payload_roundtrips_through_json() {
        let payload = sample_enrollment();
        let json = serde_json::to_string(&payload).unwrap();
        let back: EventPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), "StudentEnrolled");
    }

    #[test]
    fn extract_rejects_other_variants() {
        let payload = sample_enrollment();
        assert!(StudentEnrolled::extract(&payload).is_some());
        assert!(PaymentReconciled::extract(&payload).is_none());
    }

    #[test]
    fn new_event_is_tenant_scoped() {
        let tenant = Uuid::now_v7();
        let event = DomainEvent::new(tenant, sample_enrollment(), None);
        assert_eq!(event.tenant_id, tenant);
        assert_eq!(event.event_type(), "StudentEnrolled");
    }
}
