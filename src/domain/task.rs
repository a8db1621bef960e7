use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unit of work handed to the allocation engine.
///
/// The engine never interprets the payload; it is carried from the announcement to the
/// awarded worker unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub action: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl Task {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            parameters: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    /// String form of a parameter; non-string scalars are rendered
    pub fn str_param(&self, key: &str) -> Option<String> {
        match self.parameters.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn i64_param(&self, key: &str, default: i64) -> i64 {
        self.parameters
            .get(key)
            .and_then(Value::as_i64)
            .unwrap_or(default)
    }

    pub fn bool_param(&self, key: &str, default: bool) -> bool {
        match self.parameters.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => default,
        }
    }

    pub fn has_param(&self, key: &str) -> bool {
        self.parameters.contains_key(key)
    }

    pub fn has_params(&self, keys: &[&str]) -> bool {
        keys.iter().all(|k| self.parameters.contains_key(*k))
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task[{}", self.action)?;
        if !self.parameters.is_empty() {
            write!(f, " {}", Value::Object(self.parameters.clone()))?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_parameter_access() {
        let task = Task::new("mine")
            .with_param("block", "iron_ore")
            .with_param("quantity", 16)
            .with_param("urgent", "TRUE");

        assert_eq!(task.str_param("block").as_deref(), Some("iron_ore"));
        assert_eq!(task.str_param("quantity").as_deref(), Some("16"));
        assert_eq!(task.i64_param("quantity", 0), 16);
        assert_eq!(task.i64_param("missing", 3), 3);
        assert!(task.bool_param("urgent", false));
        assert!(task.has_params(&["block", "quantity"]));
        assert!(!task.has_params(&["block", "target"]));
    }

    #[test]
    fn display_includes_action() {
        assert_eq!(Task::new("build").to_string(), "Task[build]");
    }
}
