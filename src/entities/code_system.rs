// 🗂️ Code Systems - The three vocabularies the bridge reconciles
//
// NAMASTE (national AYUSH codes), WHO ICD-11 (TM2 + Biomedicine modules)
// and the WHO standardized Ayurveda terminology. Each is identified by a
// fixed URI; short aliases are accepted wherever a system is parsed.

use crate::error::ParseEnumError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const NAMASTE_URI: &str = "https://ayush.gov.in/fhir/CodeSystem/namaste";
pub const ICD11_URI: &str = "http://id.who.int/icd/release/11/mms";
pub const WHO_AYURVEDA_URI: &str = "https://who.int/fhir/CodeSystem/ayurveda";

// ============================================================================
// CODE SYSTEM
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CodeSystem {
    #[serde(rename = "https://ayush.gov.in/fhir/CodeSystem/namaste", alias = "namaste")]
    Namaste,

    #[serde(rename = "http://id.who.int/icd/release/11/mms", alias = "icd11")]
    Icd11,

    #[serde(rename = "https://who.int/fhir/CodeSystem/ayurveda", alias = "who-ayurveda")]
    WhoAyurveda,
}

impl CodeSystem {
    pub const ALL: [CodeSystem; 3] = [CodeSystem::Namaste, CodeSystem::Icd11, CodeSystem::WhoAyurveda];

    pub fn uri(&self) -> &'static str {
        match self {
            CodeSystem::Namaste => NAMASTE_URI,
            CodeSystem::Icd11 => ICD11_URI,
            CodeSystem::WhoAyurveda => WHO_AYURVEDA_URI,
        }
    }

    pub fn alias(&self) -> &'static str {
        match self {
            CodeSystem::Namaste => "namaste",
            CodeSystem::Icd11 => "icd11",
            CodeSystem::WhoAyurveda => "who-ayurveda",
        }
    }

    /// Backing collection (table) for this system's code entries.
    pub fn table(&self) -> &'static str {
        match self {
            CodeSystem::Namaste => "namaste_codes",
            CodeSystem::Icd11 => "icd11_codes",
            CodeSystem::WhoAyurveda => "who_ayurveda_codes",
        }
    }

    /// Only ICD-11 partitions its codes into modules and a parent/child tree.
    pub fn is_hierarchical(&self) -> bool {
        matches!(self, CodeSystem::Icd11)
    }
}

impl fmt::Display for CodeSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri())
    }
}

impl FromStr for CodeSystem {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        CodeSystem::ALL
            .into_iter()
            .find(|system| {
                system.uri().eq_ignore_ascii_case(trimmed) || system.alias().eq_ignore_ascii_case(trimmed)
            })
            .or_else(|| match trimmed.to_ascii_lowercase().as_str() {
                "icd-11" | "icd" => Some(CodeSystem::Icd11),
                "ayurveda" | "who_ayurveda" | "whoayurveda" => Some(CodeSystem::WhoAyurveda),
                _ => None,
            })
            .ok_or_else(|| ParseEnumError::new("code system", s))
    }
}

// ============================================================================
// ICD-11 MODULE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Icd11Module {
    /// Traditional Medicine Module 2
    Tm2,
    Biomedicine,
}

impl Icd11Module {
    pub fn as_str(&self) -> &'static str {
        match self {
            Icd11Module::Tm2 => "tm2",
            Icd11Module::Biomedicine => "biomedicine",
        }
    }
}

impl FromStr for Icd11Module {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tm2" => Ok(Icd11Module::Tm2),
            "biomedicine" => Ok(Icd11Module::Biomedicine),
            _ => Err(ParseEnumError::new("ICD-11 module", s)),
        }
    }
}

// ============================================================================
// ENTRY STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    #[default]
    Active,
    Inactive,
    Draft,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Active => "active",
            EntryStatus::Inactive => "inactive",
            EntryStatus::Draft => "draft",
        }
    }
}

impl FromStr for EntryStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(EntryStatus::Active),
            "inactive" => Ok(EntryStatus::Inactive),
            "draft" => Ok(EntryStatus::Draft),
            _ => Err(ParseEnumError::new("status", s)),
        }
    }
}
