//! Log record representation for the transport pipeline.
//!
//! This module defines [`LogRecord`], the immutable unit produced by the
//! application, together with [`CorrelationData`] and [`LogGroup`], the
//! container the correlator builds from records sharing a correlation id.
//! Records refer to their correlation by identifier only; the group owns
//! both the correlation data and the records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::level::{Level, LogType};

/// Value stored in a record's context payload.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<ContextValue>),
}

impl From<bool> for ContextValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ContextValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ContextValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Error details attached to a record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub kind: Option<String>,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

impl<E: std::error::Error> From<&E> for ErrorInfo {
    fn from(err: &E) -> Self {
        Self::new(err.to_string())
    }
}

/// Shared data describing a set of correlated records.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CorrelationData {
    pub correlation_id: String,
    pub name: String,
    pub custom: BTreeMap<String, ContextValue>,
}

impl CorrelationData {
    /// Create correlation data with an id and logical name.
    pub fn new(correlation_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            name: name.into(),
            custom: BTreeMap::new(),
        }
    }

    /// Attach a custom attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }
}

/// A single application log event.
#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    /// Time the record was created.
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub log_type: LogType,
    /// Priority hint added to the level's severity rank.
    pub weight: i32,
    pub message: String,
    pub error: Option<ErrorInfo>,
    /// User specific structured context.
    pub context: BTreeMap<String, ContextValue>,
    /// Identifier of the correlation this record belongs to, if any.
    pub correlation_id: Option<String>,
    /// Context objects already rendered to strings by the caller.
    pub context_fields: BTreeMap<String, Vec<String>>,
}

impl LogRecord {
    /// Construct a record at `level` with the current timestamp.
    pub fn new(level: Level, message: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            log_type: LogType::Log,
            weight: 0,
            message: message.to_owned(),
            error: None,
            context: BTreeMap::new(),
            correlation_id: None,
            context_fields: BTreeMap::new(),
        }
    }

    /// Construct an audit record.
    pub fn audit(level: Level, message: &str) -> Self {
        Self {
            log_type: LogType::Audit,
            ..Self::new(level, message)
        }
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_context_field(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.context_fields.insert(key.into(), values);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Severity rank of the level plus the weight hint.
    pub fn weighted_priority(&self) -> i32 {
        self.level.severity().saturating_add(self.weight)
    }

    pub fn is_audit(&self) -> bool {
        self.log_type == LogType::Audit
    }
}

/// Records sharing one correlation, in submission order.
#[derive(Clone, Debug, PartialEq)]
pub struct LogGroup {
    pub correlation: Option<CorrelationData>,
    pub records: Vec<LogRecord>,
}

impl LogGroup {
    /// Group holding a single uncorrelated record.
    pub fn singleton(record: LogRecord) -> Self {
        Self {
            correlation: None,
            records: vec![record],
        }
    }

    /// Empty group owning `correlation`.
    pub fn correlated(correlation: CorrelationData) -> Self {
        Self {
            correlation: Some(correlation),
            records: Vec::new(),
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation.as_ref().map(|c| c.correlation_id.as_str())
    }

    pub fn push(&mut self, record: LogRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Highest weighted priority among the group's records.
    pub fn weighted_priority(&self) -> i32 {
        self.records
            .iter()
            .map(LogRecord::weighted_priority)
            .max()
            .unwrap_or(i32::MIN)
    }

    pub fn contains_audit(&self) -> bool {
        self.records.iter().any(LogRecord::is_audit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_raises_priority() {
        let record = LogRecord::new(Level::Info, "hello").with_weight(2);
        assert_eq!(record.weighted_priority(), Level::Error.severity());
    }

    #[test]
    fn group_priority_is_max_of_records() {
        let mut group = LogGroup::correlated(CorrelationData::new("c1", "checkout"));
        group.push(LogRecord::new(Level::Debug, "a"));
        group.push(LogRecord::new(Level::Warn, "b"));
        assert_eq!(group.weighted_priority(), Level::Warn.severity());
        assert_eq!(group.correlation_id(), Some("c1"));
        assert!(!group.contains_audit());
    }

    #[test]
    fn audit_constructor_sets_type() {
        let record = LogRecord::audit(Level::Info, "login");
        assert!(record.is_audit());
        assert!(LogGroup::singleton(record).contains_audit());
    }
}
