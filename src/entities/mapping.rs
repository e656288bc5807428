// 🔗 Concept Mapping - Directed, versioned edge between two codes
//
// A mapping references both ends by value (system + code). The target may
// not be registered yet; that is a valid forward reference.

use super::code_system::CodeSystem;
use crate::error::{ParseEnumError, ValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// EQUIVALENCE
// ============================================================================

/// FHIR ConceptMap grade of how closely a target matches its source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Equivalence {
    Equivalent,
    Wider,
    Narrower,
    Inexact,
}

impl Equivalence {
    pub const ALL: [Equivalence; 4] = [
        Equivalence::Equivalent,
        Equivalence::Wider,
        Equivalence::Narrower,
        Equivalence::Inexact,
    ];

    /// inexact < wider = narrower < equivalent
    pub fn strength(&self) -> u8 {
        match self {
            Equivalence::Equivalent => 2,
            Equivalence::Wider | Equivalence::Narrower => 1,
            Equivalence::Inexact => 0,
        }
    }

    /// Equivalence of the two-hop path `self` then `next`: the weaker of the pair.
    ///
    /// Wider and narrower have equal strength, so "the weaker" does not pick
    /// one when they meet. That tie is broken by returning inexact instead of
    /// either hop: a wider hop followed by a narrower hop (or the reverse) has
    /// no consistent direction left. Equal hops (wider then wider) keep it.
    pub fn compose(self, next: Equivalence) -> Equivalence {
        match (self, next) {
            (Equivalence::Inexact, _) | (_, Equivalence::Inexact) => Equivalence::Inexact,
            (Equivalence::Equivalent, other) | (other, Equivalence::Equivalent) => other,
            (a, b) if a == b => a,
            _ => Equivalence::Inexact,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Equivalence::Equivalent => "equivalent",
            Equivalence::Wider => "wider",
            Equivalence::Narrower => "narrower",
            Equivalence::Inexact => "inexact",
        }
    }
}

impl fmt::Display for Equivalence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Equivalence {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "equivalent" | "equal" => Ok(Equivalence::Equivalent),
            "wider" | "subsumes" => Ok(Equivalence::Wider),
            "narrower" | "specializes" => Ok(Equivalence::Narrower),
            "inexact" | "relatedto" => Ok(Equivalence::Inexact),
            _ => Err(ParseEnumError::new("equivalence", s)),
        }
    }
}

// ============================================================================
// MAPPING METHOD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MappingMethod {
    #[default]
    Manual,
    Automatic,
    SemiAutomatic,
    ExpertReview,
}

impl MappingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingMethod::Manual => "manual",
            MappingMethod::Automatic => "automatic",
            MappingMethod::SemiAutomatic => "semi-automatic",
            MappingMethod::ExpertReview => "expert-review",
        }
    }
}

impl FromStr for MappingMethod {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(MappingMethod::Manual),
            "automatic" => Ok(MappingMethod::Automatic),
            "semi-automatic" => Ok(MappingMethod::SemiAutomatic),
            "expert-review" => Ok(MappingMethod::ExpertReview),
            _ => Err(ParseEnumError::new("mapping method", s)),
        }
    }
}

// ============================================================================
// CONCEPT MAPPING
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptMapping {
    pub source: CodeSystem,
    pub target: CodeSystem,
    pub source_code: String,
    pub target_code: String,
    pub equivalence: Equivalence,

    /// Always within [0, 1]
    pub confidence: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated_at: Option<DateTime<Utc>>,

    pub version: String,
    pub last_updated: DateTime<Utc>,

    #[serde(default)]
    pub mapping_method: MappingMethod,
}

impl ConceptMapping {
    pub fn new(
        source: CodeSystem,
        source_code: impl Into<String>,
        target: CodeSystem,
        target_code: impl Into<String>,
        equivalence: Equivalence,
        confidence: f64,
    ) -> Self {
        ConceptMapping {
            source,
            target,
            source_code: source_code.into(),
            target_code: target_code.into(),
            equivalence,
            confidence,
            comment: None,
            validated_by: None,
            validated_at: None,
            version: "1.0.0".to_string(),
            last_updated: Utc::now(),
            mapping_method: MappingMethod::Manual,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_method(mut self, method: MappingMethod) -> Self {
        self.mapping_method = method;
        self
    }

    pub fn validated(mut self, validator: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.validated_by = Some(validator.into());
        self.validated_at = Some(at);
        self
    }

    pub fn is_validated(&self) -> bool {
        self.validated_by.is_some()
    }

    /// Fingerprint of the content (last_updated excluded)
    pub fn content_hash(&self) -> String {
        let content = serde_json::json!({
            "source": self.source,
            "target": self.target,
            "sourceCode": self.source_code,
            "targetCode": self.target_code,
            "equivalence": self.equivalence,
            "confidence": self.confidence,
            "comment": self.comment,
            "validatedBy": self.validated_by,
            "validatedAt": self.validated_at,
            "version": self.version,
            "mappingMethod": self.mapping_method,
        });

        let mut hasher = Sha256::new();
        hasher.update(content.to_string());
        format!("{:x}", hasher.finalize())
    }

    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let context = "ConceptMapping";
        let mut errors = Vec::new();

        if self.source_code.trim().is_empty() {
            errors.push(ValidationError::new(context, "sourceCode", "Required field is empty"));
        }

        if self.target_code.trim().is_empty() {
            errors.push(ValidationError::new(context, "targetCode", "Required field is empty"));
        }

        if self.source == self.target && self.source_code == self.target_code {
            errors.push(ValidationError::new(context, "targetCode", "A code cannot map to itself"));
        }

        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            errors.push(ValidationError::new(
                context,
                "confidence",
                format!("Must be between 0.0 and 1.0, got {}", self.confidence),
            ));
        }

        if self.version.trim().is_empty() {
            errors.push(ValidationError::new(context, "version", "Required field is empty"));
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

    #[test]
    fn test_strength_ordering() {
        assert!(Equivalence::Equivalent.strength() > Equivalence::Narrower.strength());
        assert_eq!(Equivalence::Wider.strength(), Equivalence::Narrower.strength());
        assert!(Equivalence::Narrower.strength() > Equivalence::Inexact.strength());
    }

    #[test]
    fn test_compose_takes_weaker_hop() {
        use Equivalence::*;

        assert_eq!(Equivalent.compose(Narrower), Narrower);
        assert_eq!(Wider.compose(Equivalent), Wider);
        assert_eq!(Equivalent.compose(Equivalent), Equivalent);
        assert_eq!(Narrower.compose(Narrower), Narrower);
        assert_eq!(Equivalent.compose(Inexact), Inexact);
        assert_eq!(Wider.compose(Narrower), Inexact);
        assert_eq!(Narrower.compose(Wider), Inexact);
    }

    #[test]
    fn test_compose_never_strengthens() {
        for a in Equivalence::ALL {
            for b in Equivalence::ALL {
                let composed = a.compose(b);
                assert!(composed.strength() <= a.strength().min(b.strength()));
            }
        }
    }

    #[test]
    fn test_fhir_synonyms_parse() {
        assert_eq!("equal".parse::<Equivalence>().unwrap(), Equivalence::Equivalent);
        assert_eq!("subsumes".parse::<Equivalence>().unwrap(), Equivalence::Wider);
        assert_eq!("specializes".parse::<Equivalence>().unwrap(), Equivalence::Narrower);
        assert!("disjoint".parse::<Equivalence>().is_err());
    }

    #[test]
    fn test_confidence_bounds() {
        let ok = ConceptMapping::new(CodeSystem::Namaste, "N1", CodeSystem::Icd11, "I1", Equivalence::Equivalent, 1.0);
        assert!(ok.validate().is_ok());

        for bad in [-0.01, 1.01, f64::NAN, f64::INFINITY] {
            let mut mapping = ok.clone();
            mapping.confidence = bad;
            let errors = mapping.validate().unwrap_err();
            assert_eq!(errors[0].field, "confidence");
        }
    }

    #[test]
    fn test_self_mapping_rejected() {
        let mapping = ConceptMapping::new(CodeSystem::Icd11, "SM30", CodeSystem::Icd11, "SM30", Equivalence::Equivalent, 0.9);
        assert!(mapping.validate().is_err());
    }

    #[test]
    fn test_serialized_field_names() {
        let mapping = ConceptMapping::new(CodeSystem::Namaste, "N1", CodeSystem::Icd11, "I1", Equivalence::Wider, 0.5)
            .with_method(MappingMethod::ExpertReview);
        let json = serde_json::to_value(&mapping).unwrap();

        assert_eq!(json["sourceCode"], "N1");
        assert_eq!(json["targetCode"], "I1");
        assert_eq!(json["equivalence"], "wider");
        assert_eq!(json["mappingMethod"], "expert-review");
        assert!(json.get("validatedBy").is_none());
    }
}
