//! Metadata filter model.
//!
//! A filter is an ordered list of `prefix:name` keys, each mapped to either a
//! literal value or a condition. Conditions validate their operator's arity
//! when they are built, so an injected condition is always well formed.

use crate::error::{OpdmError, Result};
use glob::Pattern;
use regex::Regex;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::str::FromStr;

/// Separator between the values of multi-value conditions on the wire.
pub const VALUE_SEPARATOR: &str = ",";

/// Comparison operators understood by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Is,
    IsNot,
    IsOneOf,
    IsNotOneOf,
    IsBefore,
    IsAfter,
    IsBetween,
    IsNotBetween,
    Exists,
    DoesNotExist,
    Contains,
    MatchesRegex,
    MatchesWildcard,
}

/// Number of values an operator takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    None,
    One,
    Two,
    AtLeastOne,
}

impl Arity {
    fn accepts(&self, count: usize) -> bool {
        match self {
            Self::None => count == 0,
            Self::One => count == 1,
            Self::Two => count == 2,
            Self::AtLeastOne => count >= 1,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Self::None => "no values",
            Self::One => "exactly one value",
            Self::Two => "exactly two values",
            Self::AtLeastOne => "at least one value",
        }
    }
}

impl Operator {
    pub const ALL: [Operator; 13] = [
        Self::Is,
        Self::IsNot,
        Self::IsOneOf,
        Self::IsNotOneOf,
        Self::IsBefore,
        Self::IsAfter,
        Self::IsBetween,
        Self::IsNotBetween,
        Self::Exists,
        Self::DoesNotExist,
        Self::Contains,
        Self::MatchesRegex,
        Self::MatchesWildcard,
    ];

    /// Wire spelling of the operator.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Is => "is",
            Self::IsNot => "is not",
            Self::IsOneOf => "is one of",
            Self::IsNotOneOf => "is not one of",
            Self::IsBefore => "is before",
            Self::IsAfter => "is after",
            Self::IsBetween => "is between",
            Self::IsNotBetween => "is not between",
            Self::Exists => "exists",
            Self::DoesNotExist => "does not exist",
            Self::Contains => "contains",
            Self::MatchesRegex => "matches regex",
            Self::MatchesWildcard => "matches wildcard",
        }
    }

    pub fn arity(&self) -> Arity {
        match self {
            Self::Exists | Self::DoesNotExist => Arity::None,
            Self::IsBetween | Self::IsNotBetween => Arity::Two,
            Self::IsOneOf | Self::IsNotOneOf => Arity::AtLeastOne,
            _ => Arity::One,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = OpdmError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == normalized)
            .ok_or_else(|| OpdmError::UnsupportedEnumValue {
                kind: "operator",
                value: s.to_string(),
                allowed: Self::ALL
                    .iter()
                    .map(|op| op.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

/// A validated `{operator, values}` condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    operator: Operator,
    values: Vec<String>,
}

impl Condition {
    /// Build a condition, checking the operator's arity and, for pattern
    /// operators, that the pattern compiles.
    pub fn new<I, S>(operator: Operator, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        let arity = operator.arity();
        if !arity.accepts(values.len()) {
            return Err(OpdmError::OperatorArity {
                operator: operator.as_str().to_string(),
                expected: arity.describe(),
                got: values.len(),
            });
        }

        if let Some(value) = values.iter().find(|v| v.contains(VALUE_SEPARATOR)) {
            if arity != Arity::One {
                return Err(OpdmError::InvalidArgument(format!(
                    "value '{}' of a multi-value condition contains '{}'",
                    value, VALUE_SEPARATOR
                )));
            }
        }

        match operator {
            Operator::MatchesRegex => {
                Regex::new(&values[0]).map_err(|e| OpdmError::InvalidPattern {
                    pattern: values[0].clone(),
                    reason: e.to_string(),
                })?;
            }
            Operator::MatchesWildcard => {
                Pattern::new(&values[0]).map_err(|e| OpdmError::InvalidPattern {
                    pattern: values[0].clone(),
                    reason: e.to_string(),
                })?;
            }
            _ => {}
        }

        Ok(Self { operator, values })
    }

    /// Single-value condition, e.g. `is after`.
    pub fn unary(operator: Operator, value: impl Into<String>) -> Result<Self> {
        Self::new(operator, [value.into()])
    }

    pub fn between(from: impl Into<String>, to: impl Into<String>) -> Result<Self> {
        Self::new(Operator::IsBetween, [from.into(), to.into()])
    }

    pub fn one_of<I, S>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Operator::IsOneOf, values)
    }

    pub fn exists() -> Self {
        Self {
            operator: Operator::Exists,
            values: Vec::new(),
        }
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Element text carried on the wire.
    pub fn wire_text(&self) -> String {
        self.values.join(VALUE_SEPARATOR)
    }
}

/// Value of one filter field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    /// Plain value, implicitly the `is` operator
    Literal(String),
    Condition(Condition),
}

impl FilterValue {
    pub fn wire_text(&self) -> String {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Condition(condition) => condition.wire_text(),
        }
    }

    /// Operator attribute to emit, `None` for literals.
    pub fn operator(&self) -> Option<Operator> {
        match self {
            Self::Literal(_) => None,
            Self::Condition(condition) => Some(condition.operator()),
        }
    }

    /// Values this filter compares against.
    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::Literal(value) => vec![value.as_str()],
            Self::Condition(condition) => condition.values().iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        Self::Literal(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        Self::Literal(value)
    }
}

impl From<Condition> for FilterValue {
    fn from(condition: Condition) -> Self {
        Self::Condition(condition)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawValues {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFilterValue {
    Literal(String),
    Condition {
        operator: String,
        #[serde(default)]
        value: Option<RawValues>,
    },
}

impl TryFrom<RawFilterValue> for FilterValue {
    type Error = OpdmError;

    fn try_from(raw: RawFilterValue) -> Result<Self> {
        match raw {
            RawFilterValue::Literal(value) => Ok(Self::Literal(value)),
            RawFilterValue::Condition { operator, value } => {
                let operator: Operator = operator.parse()?;
                let values = match value {
                    None => Vec::new(),
                    // "IGM,BDS,RULESET" style shorthand for multi-value operators
                    Some(RawValues::One(value))
                        if matches!(operator.arity(), Arity::Two | Arity::AtLeastOne) =>
                    {
                        value
                            .split(VALUE_SEPARATOR)
                            .map(|v| v.trim().to_string())
                            .collect()
                    }
                    Some(RawValues::One(value)) => vec![value],
                    Some(RawValues::Many(values)) => values,
                };
                Ok(Self::Condition(Condition::new(operator, values)?))
            }
        }
    }
}

impl<'de> Deserialize<'de> for FilterValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = RawFilterValue::deserialize(deserializer)?;
        FilterValue::try_from(raw).map_err(de::Error::custom)
    }
}

/// Ordered `prefix:name` → value mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    fields: Vec<(String, FilterValue)>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`MetadataFilter::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert a field. An existing key keeps its position and gets the new value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FilterValue>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&FilterValue> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FilterValue)> {
        self.fields.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<FilterValue>> FromIterator<(K, V)> for MetadataFilter {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut filter = Self::new();
        for (key, value) in iter {
            filter.insert(key, value);
        }
        filter
    }
}

impl<'de> Deserialize<'de> for MetadataFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct FilterVisitor;

        impl<'de> Visitor<'de> for FilterVisitor {
            type Value = MetadataFilter;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of \"prefix:name\" keys to values or conditions")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
                let mut filter = MetadataFilter::new();
                while let Some((key, value)) = map.next_entry::<String, FilterValue>()? {
                    filter.insert(key, value);
                }
                Ok(filter)
            }
        }

        deserializer.deserialize_map(FilterVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_round_trip_spelling() {
        for op in Operator::ALL {
            assert_eq!(op.as_str().parse::<Operator>().unwrap(), op);
        }
        assert_eq!("  Is After ".parse::<Operator>().unwrap(), Operator::IsAfter);
    }

    #[test]
    fn test_unknown_operator() {
        let err = "is near".parse::<Operator>().unwrap_err();
        assert!(matches!(err, OpdmError::UnsupportedEnumValue { kind: "operator", .. }));
    }

    #[test]
    fn test_arity_enforced() {
        assert!(Condition::unary(Operator::IsAfter, "2021-12-30T00:00:00").is_ok());
        let err = Condition::new(Operator::IsAfter, ["a", "b"]).unwrap_err();
        assert!(matches!(err, OpdmError::OperatorArity { got: 2, .. }));
        assert!(Condition::new(Operator::IsBetween, ["a"]).is_err());
        assert!(Condition::new(Operator::Exists, ["a"]).is_err());
        assert!(Condition::new(Operator::IsOneOf, Vec::<String>::new()).is_err());
        assert!(Condition::new(Operator::DoesNotExist, Vec::<String>::new()).is_ok());
    }

    #[test]
    fn test_wire_text() {
        let between = Condition::between("2021-01-01", "2021-02-01").unwrap();
        assert_eq!(between.wire_text(), "2021-01-01,2021-02-01");
        let not_one_of = Condition::new(Operator::IsNotOneOf, ["IGM", "BDS", "RULESET"]).unwrap();
        assert_eq!(not_one_of.wire_text(), "IGM,BDS,RULESET");
        assert_eq!(Condition::exists().wire_text(), "");
    }

    #[test]
    fn test_separator_inside_multi_value_rejected() {
        assert!(Condition::one_of(["a,b", "c"]).is_err());
        assert!(Condition::unary(Operator::Contains, "a,b").is_ok());
    }

    #[test]
    fn test_patterns_validated() {
        assert!(Condition::unary(Operator::MatchesRegex, "^ELERING_.*$").is_ok());
        let err = Condition::unary(Operator::MatchesRegex, "(unclosed").unwrap_err();
        assert!(matches!(err, OpdmError::InvalidPattern { .. }));
        assert!(Condition::unary(Operator::MatchesWildcard, "*_SV_*.zip").is_ok());
        assert!(Condition::unary(Operator::MatchesWildcard, "[a-").is_err());
    }

    #[test]
    fn test_filter_insertion_order() {
        let filter = MetadataFilter::new()
            .with("pmd:timeHorizon", "1D")
            .with("pmd:scenarioDate", "2021-12-30")
            .with("pmd:timeHorizon", "2D");
        let keys: Vec<_> = filter.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["pmd:timeHorizon", "pmd:scenarioDate"]);
        assert_eq!(
            filter.get("pmd:timeHorizon"),
            Some(&FilterValue::Literal("2D".to_string()))
        );
    }

    #[test]
    fn test_deserialize_filter_json() {
        let json = r#"{
            "pmd:timeHorizon": "1D",
            "pmd:scenarioDate": {"operator": "is after", "value": "2021-12-30T00:00:00"},
            "pmd:version": {"operator": "is between", "value": ["001", "005"]},
            "pmd:TSO": {"operator": "exists"}
        }"#;
        let filter: MetadataFilter = serde_json::from_str(json).unwrap();
        let keys: Vec<_> = filter.iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec!["pmd:timeHorizon", "pmd:scenarioDate", "pmd:version", "pmd:TSO"]
        );
        assert_eq!(
            filter.get("pmd:scenarioDate").unwrap().operator(),
            Some(Operator::IsAfter)
        );
        assert_eq!(
            filter.get("pmd:version").unwrap().values(),
            vec!["001", "005"]
        );
    }

    #[test]
    fn test_deserialize_rejects_bad_arity() {
        let json = r#"{"pmd:scenarioDate": {"operator": "is after", "value": ["a", "b"]}}"#;
        assert!(serde_json::from_str::<MetadataFilter>(json).is_err());
        let json = r#"{"pmd:scenarioDate": {"operator": "is between", "value": "a"}}"#;
        assert!(serde_json::from_str::<MetadataFilter>(json).is_err());
    }

    #[test]
    fn test_deserialize_comma_shorthand() {
        let json = r#"{"pmd:Object-Type": {"operator": "is not one of", "value": "IGM,BDS,RULESET"}}"#;
        let filter: MetadataFilter = serde_json::from_str(json).unwrap();
        assert_eq!(
            filter.get("pmd:Object-Type").unwrap().values(),
            vec!["IGM", "BDS", "RULESET"]
        );
    }

    #[test]
    fn test_deserialize_yaml() {
        let yaml = r#"
pmd:timeHorizon: 1D
pmd:Object-Type:
  operator: is not one of
  value: [IGM, BDS, RULESET]
"#;
        let filter: MetadataFilter = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(filter.len(), 2);
        assert_eq!(
            filter.get("pmd:Object-Type").unwrap().operator(),
            Some(Operator::IsNotOneOf)
        );
    }
}
