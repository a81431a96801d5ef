use std::collections::HashMap;

use crate::db::ContactRecord;
use crate::rules::condition::{ConditionValue, FieldResolver};

/// Resolves condition fields against a contact, with caller-supplied
/// overrides taking precedence over stored attributes.
pub struct ContactFields<'a> {
    contact: &'a ContactRecord,
    overrides: &'a HashMap<String, ConditionValue>,
}

impl<'a> ContactFields<'a> {
    pub fn new(contact: &'a ContactRecord, overrides: &'a HashMap<String, ConditionValue>) -> Self {
        Self { contact, overrides }
    }

    fn builtin(&self, field: &str) -> Option<ConditionValue> {
        let c = self.contact;
        let value: ConditionValue = match field {
            "contact_type_id" => c.contact_type_id.clone().into(),
            "contact_source_id" => c.contact_source_id.clone().into(),
            "priority" => c.priority.as_str().into(),
            "status" => c.status.as_str().into(),
            "lead_score" => c.lead_score.into(),
            "estimated_value" => match c.estimated_value {
                Some(value) => ConditionValue::Number(decimal_to_f64(value)),
                None => ConditionValue::Null,
            },
            "country" => c.country.clone().into(),
            "state" => c.state.clone().into(),
            "city" => c.city.clone().into(),
            "company" => c.company.clone().into(),
            "utm_source" => c.utm_source.clone().into(),
            "utm_medium" => c.utm_medium.clone().into(),
            "utm_campaign" => c.utm_campaign.clone().into(),
            "email" => c.email.clone().into(),
            "email_domain" => email_domain(c.email.as_deref()).into(),
            "phone" => c.phone.clone().into(),
            "first_name" => c.first_name.as_str().into(),
            "last_name" => c.last_name.as_str().into(),
            "email_opened" => c.email_opened.into(),
            "email_clicked" => c.email_clicked.into(),
            "total_interactions" => c.total_interactions.into(),
            _ => return None,
        };
        Some(value)
    }

    fn custom(&self, field: &str) -> ConditionValue {
        self.contact
            .custom_fields
            .get(field)
            .map(|value| ConditionValue::from_json(value, None))
            .unwrap_or(ConditionValue::Null)
    }
}

impl FieldResolver for ContactFields<'_> {
    fn resolve(&self, field: &str) -> ConditionValue {
        if let Some(value) = self.overrides.get(field) {
            return value.clone();
        }
        self.builtin(field).unwrap_or_else(|| self.custom(field))
    }
}

/// Lowercased domain part of an email address.
pub fn email_domain(email: Option<&str>) -> Option<String> {
    let (_, domain) = email?.trim().rsplit_once('@')?;
    if domain.is_empty() {
        return None;
    }
    Some(domain.to_ascii_lowercase())
}

pub(crate) fn decimal_to_f64(value: rust_decimal::Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    use super::{ContactFields, email_domain};
    use crate::db::{ContactPriority, ContactRecord, ContactStatus};
    use crate::rules::condition::{ConditionValue, FieldResolver};

    fn contact() -> ContactRecord {
        let now = Utc::now();
        ContactRecord {
            id: Uuid::new_v4(),
            first_name: "Dana".to_string(),
            last_name: "Reyes".to_string(),
            email: Some("dana@Northwind.io".to_string()),
            phone: Some("+1 555 0100".to_string()),
            company: Some("Northwind".to_string()),
            contact_type_id: Some("enterprise".to_string()),
            contact_source_id: None,
            priority: ContactPriority::High,
            status: ContactStatus::New,
            lead_score: 42,
            estimated_value: Some(dec!(75000.50)),
            country: Some("US".to_string()),
            state: Some("CA".to_string()),
            city: None,
            utm_source: Some("linkedin".to_string()),
            utm_medium: None,
            utm_campaign: None,
            email_opened: true,
            email_clicked: false,
            total_interactions: 3,
            next_followup_at: None,
            custom_fields: serde_json::json!({"industry": "logistics", "seats": 40}),
            assigned_to: None,
            assigned_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn resolves_builtin_fields_with_native_types() {
        let contact = contact();
        let overrides = HashMap::new();
        let fields = ContactFields::new(&contact, &overrides);
        assert_eq!(fields.resolve("lead_score"), ConditionValue::Number(42.0));
        assert_eq!(fields.resolve("estimated_value"), ConditionValue::Number(75000.5));
        assert_eq!(fields.resolve("priority"), ConditionValue::from("high"));
        assert_eq!(fields.resolve("email_opened"), ConditionValue::Bool(true));
        assert_eq!(fields.resolve("city"), ConditionValue::Null);
        assert_eq!(fields.resolve("email_domain"), ConditionValue::from("northwind.io"));
    }

    #[test]
    fn falls_back_to_custom_fields_then_null() {
        let contact = contact();
        let overrides = HashMap::new();
        let fields = ContactFields::new(&contact, &overrides);
        assert_eq!(fields.resolve("industry"), ConditionValue::from("logistics"));
        assert_eq!(fields.resolve("seats"), ConditionValue::Number(40.0));
        assert_eq!(fields.resolve("nonexistent"), ConditionValue::Null);
    }

    #[test]
    fn overrides_win_over_contact_attributes() {
        let contact = contact();
        let overrides = HashMap::from([("country".to_string(), ConditionValue::from("DE"))]);
        let fields = ContactFields::new(&contact, &overrides);
        assert_eq!(fields.resolve("country"), ConditionValue::from("DE"));
    }

    #[test]
    fn email_domain_requires_an_at_sign() {
        assert_eq!(email_domain(Some("nobody")), None);
        assert_eq!(email_domain(Some("a@")), None);
        assert_eq!(email_domain(None), None);
    }
}
