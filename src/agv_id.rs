use crate::errors::ValidationError;

/// Characters allowed in an `AgvId` field and, by extension, in any MQTT
/// topic level derived from it (§3).
fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-')
}

fn validate_field(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::EmptyAgvIdField(field));
    }
    if !value.chars().all(is_allowed_char) {
        return Err(ValidationError::ForbiddenAgvIdChar {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Logical identity of an AGV: a `(manufacturer, serialNumber)` pair. Both
/// fields double as MQTT topic levels and are therefore restricted to the
/// charset `A-Za-z0-9_.:-` (§3).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AgvId {
    pub manufacturer: String,
    pub serial_number: String,
}

impl AgvId {
    pub fn new(manufacturer: impl Into<String>, serial_number: impl Into<String>) -> Result<Self, ValidationError> {
        let manufacturer = manufacturer.into();
        let serial_number = serial_number.into();
        validate_field("manufacturer", &manufacturer)?;
        validate_field("serialNumber", &serial_number)?;
        Ok(Self { manufacturer, serial_number })
    }

    pub fn as_partial(&self) -> PartialAgvId {
        PartialAgvId {
            manufacturer: Some(self.manufacturer.clone()),
            serial_number: Some(self.serial_number.clone()),
        }
    }

    pub fn matches(&self, partial: &PartialAgvId) -> bool {
        partial.manufacturer.as_deref().map_or(true, |m| m == self.manufacturer)
            && partial.serial_number.as_deref().map_or(true, |s| s == self.serial_number)
    }
}

/// A possibly-incomplete `AgvId`; missing fields denote a wildcard subject
/// (§3). Present fields are validated the same as a concrete `AgvId`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PartialAgvId {
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
}

impl PartialAgvId {
    pub fn wildcard() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(m) = &self.manufacturer {
            validate_field("manufacturer", m)?;
        }
        if let Some(s) = &self.serial_number {
            validate_field("serialNumber", s)?;
        }
        Ok(())
    }

    pub fn is_concrete(&self) -> bool {
        self.manufacturer.is_some() && self.serial_number.is_some()
    }
}

impl From<AgvId> for PartialAgvId {
    fn from(id: AgvId) -> Self {
        id.as_partial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_forbidden_characters() {
        for bad in ["", "\u{0}", "+", "#", "/", ","] {
            assert!(AgvId::new(bad, "001").is_err(), "expected rejection for {bad:?}");
            assert!(AgvId::new("ACME", bad).is_err(), "expected rejection for {bad:?}");
        }
    }

    #[test]
    fn accepts_allowed_charset() {
        assert!(AgvId::new("ACME_Robotics.v1:2", "AGV-001").is_ok());
    }

    #[test]
    fn partial_matches_wildcards() {
        let id = AgvId::new("ACME", "001").unwrap();
        assert!(id.matches(&PartialAgvId::wildcard()));
        assert!(id.matches(&PartialAgvId { manufacturer: Some("ACME".into()), serial_number: None }));
        assert!(!id.matches(&PartialAgvId { manufacturer: Some("OTHER".into()), serial_number: None }));
    }
}
