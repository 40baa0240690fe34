// Transformation model domain types (the dbt-style layer)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// How a model's result is embodied in the target store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Materialization {
    Table,
    View,
    Incremental,
    Ephemeral,
}

impl Materialization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Materialization::Table => "table",
            Materialization::View => "view",
            Materialization::Incremental => "incremental",
            Materialization::Ephemeral => "ephemeral",
        }
    }
}

impl FromStr for Materialization {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "table" => Ok(Materialization::Table),
            "view" => Ok(Materialization::View),
            "incremental" => Ok(Materialization::Incremental),
            "ephemeral" => Ok(Materialization::Ephemeral),
            other => Err(CoreError::config(format!(
                "invalid materialization: {other}"
            ))),
        }
    }
}

impl fmt::Display for Materialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Built-in and user-provided test kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    NotNull,
    Unique,
    Relationships,
    AcceptedValues,
    Expression,
    Custom,
}

impl TestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::NotNull => "not_null",
            TestType::Unique => "unique",
            TestType::Relationships => "relationships",
            TestType::AcceptedValues => "accepted_values",
            TestType::Expression => "expression",
            TestType::Custom => "custom",
        }
    }
}

impl FromStr for TestType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_null" => Ok(TestType::NotNull),
            "unique" => Ok(TestType::Unique),
            "relationships" => Ok(TestType::Relationships),
            "accepted_values" => Ok(TestType::AcceptedValues),
            "expression" => Ok(TestType::Expression),
            "custom" => Ok(TestType::Custom),
            other => Err(CoreError::config(format!("unknown test type: {other}"))),
        }
    }
}

/// Whether a failed test fails the run or only warns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestSeverity {
    #[default]
    Error,
    Warn,
}

impl TestSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestSeverity::Error => "error",
            TestSeverity::Warn => "warn",
        }
    }
}

impl FromStr for TestSeverity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(TestSeverity::Error),
            "warn" => Ok(TestSeverity::Warn),
            other => Err(CoreError::config(format!("unknown severity: {other}"))),
        }
    }
}

/// Outcome of one executed test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
    Error,
    Skipped,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Pass => "pass",
            TestStatus::Fail => "fail",
            TestStatus::Error => "error",
            TestStatus::Skipped => "skipped",
        }
    }
}

/// Kind of a lineage edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformationType {
    Ref,
    Source,
    Select,
}

impl TransformationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformationType::Ref => "ref",
            TransformationType::Source => "source",
            TransformationType::Select => "select",
        }
    }
}

/// One declared column of a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelColumn {
    pub name: String,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Shorthand test names attached to this column in the model definition
    #[serde(default)]
    pub tests: Vec<String>,
}

/// schema-qualified, double-quoted identifier pair
pub fn qualified_name(schema: &str, name: &str) -> String {
    format!("\"{}\".\"{}\"", schema.replace('"', ""), name.replace('"', ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialization_round_trips() {
        for m in [
            Materialization::Table,
            Materialization::View,
            Materialization::Incremental,
            Materialization::Ephemeral,
        ] {
            assert_eq!(m.as_str().parse::<Materialization>().unwrap(), m);
        }
        assert!("TABLE".parse::<Materialization>().is_err());
    }

    #[test]
    fn qualified_names_are_quoted() {
        assert_eq!(qualified_name("analytics", "orders"), "\"analytics\".\"orders\"");
        assert_eq!(qualified_name("a\"b", "t"), "\"ab\".\"t\"");
    }
}
