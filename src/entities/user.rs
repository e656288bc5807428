// 👤 User - Clinician / administrator / auditor identified by ABHA ID

use crate::error::{ParseEnumError, ValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Clinician,
    Administrator,
    Auditor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Clinician => "clinician",
            Role::Administrator => "administrator",
            Role::Auditor => "auditor",
        }
    }
}

impl FromStr for Role {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clinician" => Ok(Role::Clinician),
            "administrator" => Ok(Role::Administrator),
            "auditor" => Ok(Role::Auditor),
            _ => Err(ParseEnumError::new("role", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Unique
    pub abha_id: String,
    /// Unique
    pub email: String,
    pub name: String,
    pub role: Role,
    pub institution: String,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl User {
    pub fn new(abha_id: impl Into<String>, email: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        let now = Utc::now();
        User {
            abha_id: abha_id.into(),
            email: email.into(),
            name: name.into(),
            role,
            institution: String::new(),
            active: true,
            last_login: None,
            created: now,
            updated: now,
        }
    }

    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.abha_id.trim().is_empty() {
            errors.push(ValidationError::new("User", "abhaId", "Required field is empty"));
        }
        if !self.email.contains('@') {
            errors.push(ValidationError::new("User", "email", "Not an email address"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
