use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ContractNetError, Result};

/// A named milestone recorded against a task's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    /// Completion percentage at this milestone, 0-100
    pub percentage: f64,
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub reached_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(name: impl Into<String>, percentage: f64) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ContractNetError::invalid("checkpoint name cannot be blank"));
        }
        if !(0.0..=100.0).contains(&percentage) {
            return Err(ContractNetError::invalid(format!(
                "checkpoint percentage must be between 0 and 100, got {percentage}"
            )));
        }
        Ok(Self {
            name,
            percentage,
            description: None,
            metadata: Map::new(),
            reached_at: Utc::now(),
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:.1}%)", self.name, self.percentage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_name_and_range() {
        assert!(Checkpoint::new("", 10.0).is_err());
        assert!(Checkpoint::new("halfway", 100.5).is_err());
        assert!(Checkpoint::new("halfway", -1.0).is_err());

        let cp = Checkpoint::new("halfway", 50.0)
            .unwrap()
            .with_description("foundation laid")
            .with_metadata("blocks", 32);
        assert_eq!(cp.to_string(), "halfway (50.0%)");
        assert_eq!(cp.metadata.get("blocks"), Some(&Value::from(32)));
    }
}
