// 🏷️ Code Entry - One canonical code in one of the three vocabularies
//
// Identity is (system, code). Everything else is a value that ingestion may
// refresh. ICD-11 entries also carry a module and a parent back-reference;
// children are never stored, they are derived from parent lookups.

use super::code_system::{CodeSystem, EntryStatus, Icd11Module};
use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Longest code accepted on the write path.
pub const MAX_CODE_LEN: usize = 64;

// ============================================================================
// DESIGNATIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesignationUse {
    Preferred,
    Synonym,
    Abbreviation,
}

/// Alternate localized or contextual display string for a code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Designation {
    pub language: String,
    pub value: String,
    #[serde(rename = "use")]
    pub use_kind: DesignationUse,
}

impl Designation {
    pub fn new(language: impl Into<String>, value: impl Into<String>, use_kind: DesignationUse) -> Self {
        Designation {
            language: language.into(),
            value: value.into(),
            use_kind,
        }
    }
}

// ============================================================================
// PROPERTIES
// ============================================================================

/// Typed property value. Closed set, so every consumer matches exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum PropertyValue {
    String(String),
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
}

impl PropertyValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::String(_) => "string",
            PropertyValue::Boolean(_) => "boolean",
            PropertyValue::Integer(_) => "integer",
            PropertyValue::Decimal(_) => "decimal",
        }
    }

    /// Canonical text form used by the property filter index.
    /// The type is part of the key, so `Integer(1)` never matches `String("1")`.
    pub fn index_key(&self) -> String {
        match self {
            PropertyValue::String(v) => format!("string:{}", v),
            PropertyValue::Boolean(v) => format!("boolean:{}", v),
            PropertyValue::Integer(v) => format!("integer:{}", v),
            PropertyValue::Decimal(v) => format!("decimal:{}", v),
        }
    }

    /// Typed value from untyped text (CLI / query strings):
    /// true/false, then integer, then finite decimal, otherwise string.
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(b) = trimmed.parse::<bool>() {
            return PropertyValue::Boolean(b);
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return PropertyValue::Integer(i);
        }
        match trimmed.parse::<f64>() {
            Ok(d) if d.is_finite() => PropertyValue::Decimal(d),
            _ => PropertyValue::String(trimmed.to_string()),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Boolean(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Integer(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Decimal(value)
    }
}

// ============================================================================
// CODE ENTRY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeEntry {
    pub code: String,
    pub display: String,
    pub system: CodeSystem,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub designations: Vec<Designation>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropertyValue>,

    pub version: String,
    pub status: EntryStatus,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,

    // ICD-11 only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<Icd11Module>,

    /// Parent code in the same system, resolved by lookup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    // WHO-Ayurveda only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanskrit: Option<String>,
}

impl CodeEntry {
    pub fn new(system: CodeSystem, code: impl Into<String>, display: impl Into<String>) -> Self {
        let now = Utc::now();

        CodeEntry {
            code: code.into(),
            display: display.into(),
            system,
            definition: None,
            designations: Vec::new(),
            properties: BTreeMap::new(),
            version: "1.0.0".to_string(),
            status: EntryStatus::Active,
            created: now,
            updated: now,
            module: None,
            parent: None,
            category: None,
            sanskrit: None,
        }
    }

    /// ICD-11 entry in the given module
    pub fn icd11(module: Icd11Module, code: impl Into<String>, display: impl Into<String>) -> Self {
        let mut entry = Self::new(CodeSystem::Icd11, code, display);
        entry.module = Some(module);
        entry
    }

    pub fn with_definition(mut self, definition: impl Into<String>) -> Self {
        self.definition = Some(definition.into());
        self
    }

    pub fn with_designation(
        mut self,
        language: impl Into<String>,
        value: impl Into<String>,
        use_kind: DesignationUse,
    ) -> Self {
        self.designations.push(Designation::new(language, value, use_kind));
        self
    }

    pub fn with_property(mut self, code: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(code.into(), value.into());
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_sanskrit(mut self, sanskrit: impl Into<String>) -> Self {
        self.sanskrit = Some(sanskrit.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_status(mut self, status: EntryStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == EntryStatus::Active
    }

    /// Every text field that feeds the free-text index
    pub fn searchable_text(&self) -> Vec<&str> {
        let mut fields = vec![self.display.as_str()];
        fields.extend(self.definition.as_deref());
        fields.extend(self.sanskrit.as_deref());
        fields.extend(self.designations.iter().map(|d| d.value.as_str()));
        fields
    }

    /// Fingerprint of the content (timestamps excluded).
    /// Two ingests of the same record produce the same hash.
    pub fn content_hash(&self) -> String {
        let content = serde_json::json!({
            "code": self.code,
            "display": self.display,
            "system": self.system,
            "definition": self.definition,
            "designations": self.designations,
            "properties": self.properties,
            "version": self.version,
            "status": self.status,
            "module": self.module,
            "parent": self.parent,
            "category": self.category,
            "sanskrit": self.sanskrit,
        });

        let mut hasher = Sha256::new();
        hasher.update(content.to_string());
        format!("{:x}", hasher.finalize())
    }

    /// Structural checks that need no store access
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let context = "CodeEntry";
        let mut errors = Vec::new();

        if self.code.trim().is_empty() {
            errors.push(ValidationError::new(context, "code", "Required field is empty"));
        } else if self.code.len() > MAX_CODE_LEN {
            errors.push(ValidationError::new(
                context,
                "code",
                format!("Longer than {} characters", MAX_CODE_LEN),
            ));
        } else if self.code.chars().any(char::is_whitespace) {
            errors.push(ValidationError::new(context, "code", "Must not contain whitespace"));
        }

        if self.display.trim().is_empty() {
            errors.push(ValidationError::new(context, "display", "Required field is empty"));
        }

        if self.version.trim().is_empty() {
            errors.push(ValidationError::new(context, "version", "Required field is empty"));
        }

        if self.system.is_hierarchical() {
            if self.module.is_none() {
                errors.push(ValidationError::new(context, "module", "ICD-11 entries require a module"));
            }
            if self.parent.as_deref() == Some(self.code.as_str()) {
                errors.push(ValidationError::new(context, "parent", "A code cannot be its own parent"));
            }
        } else {
            if self.module.is_some() {
                errors.push(ValidationError::new(context, "module", "Only ICD-11 entries carry a module"));
            }
            if self.parent.is_some() {
                errors.push(ValidationError::new(context, "parent", "Only ICD-11 entries carry a parent"));
            }
        }

        if self.system != CodeSystem::WhoAyurveda && (self.category.is_some() || self.sanskrit.is_some()) {
            errors.push(ValidationError::new(
                context,
                "category",
                "Category and Sanskrit term are WHO-Ayurveda fields",
            ));
        }

        for (index, designation) in self.designations.iter().enumerate() {
            if designation.value.trim().is_empty() {
                errors.push(ValidationError::new(
                    context,
                    format!("designations[{}].value", index),
                    "Required field is empty",
                ));
            }
        }

        for (code, value) in &self.properties {
            if let PropertyValue::Decimal(v) = value {
                if !v.is_finite() {
                    errors.push(ValidationError::new(
                        context,
                        format!("properties.{}", code),
                        "Decimal values must be finite",
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vata_entry() -> CodeEntry {
        CodeEntry::new(CodeSystem::Namaste, "AAA-1", "Vata imbalance")
            .with_definition("Disorder of vata dosha")
            .with_designation("sa", "Vataroga", DesignationUse::Synonym)
            .with_property("traditional-system", "ayurveda")
    }

    #[test]
    fn test_new_entry_defaults() {
        let entry = CodeEntry::new(CodeSystem::Namaste, "AAA-1", "Vata imbalance");

        assert_eq!(entry.version, "1.0.0");
        assert_eq!(entry.status, EntryStatus::Active);
        assert_eq!(entry.created, entry.updated);
        assert!(entry.validate().is_ok());
    }

    #[test]
    fn test_content_hash_ignores_timestamps() {
        let a = vata_entry();
        let mut b = a.clone();
        b.updated = b.updated + chrono::Duration::days(3);

        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);

        let c = a.clone().with_version("2.0.0");
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn test_icd11_requires_module() {
        let mut entry = CodeEntry::icd11(Icd11Module::Tm2, "SM30", "Vata disorder pattern");
        assert!(entry.validate().is_ok());

        entry.module = None;
        let errors = entry.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.field == "module"));
    }

    #[test]
    fn test_non_icd_entries_reject_hierarchy_fields() {
        let mut entry = vata_entry();
        entry.module = Some(Icd11Module::Tm2);
        entry.parent = Some("AAA".to_string());

        let errors = entry.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_self_parent_rejected() {
        let entry = CodeEntry::icd11(Icd11Module::Tm2, "SM30", "x").with_parent("SM30");
        let errors = entry.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.field == "parent"));
    }

    #[test]
    fn test_blank_fields_and_non_finite_decimal_rejected() {
        let entry = CodeEntry::new(CodeSystem::Namaste, "A A", " ")
            .with_property("weight", f64::NAN);

        let errors = entry.validate().unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"code"));
        assert!(fields.contains(&"display"));
        assert!(fields.contains(&"properties.weight"));
    }

    #[test]
    fn test_property_index_key_carries_type() {
        assert_eq!(PropertyValue::Integer(1).index_key(), "integer:1");
        assert_eq!(PropertyValue::from("1").index_key(), "string:1");
        assert_eq!(PropertyValue::Boolean(true).index_key(), "boolean:true");
        assert_eq!(PropertyValue::Decimal(0.5).index_key(), "decimal:0.5");
    }

    #[test]
    fn test_infer_property_value() {
        assert_eq!(PropertyValue::infer("true"), PropertyValue::Boolean(true));
        assert_eq!(PropertyValue::infer(" 42 "), PropertyValue::Integer(42));
        assert_eq!(PropertyValue::infer("0.25"), PropertyValue::Decimal(0.25));
        assert_eq!(PropertyValue::infer("NaN"), PropertyValue::from("NaN"));
        assert_eq!(PropertyValue::infer("ayurveda"), PropertyValue::from("ayurveda"));
    }

    #[test]
    fn test_property_serializes_as_tagged_variant() {
        let json = serde_json::to_value(PropertyValue::Integer(7)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "integer", "value": 7}));
    }

    #[test]
    fn test_searchable_text_covers_designations() {
        let entry = vata_entry().with_designation("en", "Wind disorder", DesignationUse::Synonym);
        let text = entry.searchable_text();

        assert!(text.contains(&"Vata imbalance"));
        assert!(text.contains(&"Disorder of vata dosha"));
        assert!(text.contains(&"Wind disorder"));
    }
}
