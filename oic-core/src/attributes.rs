//! Attribute store: typed values, allowed-value / range constraints, all-or-nothing updates.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Snapshot of a resource's attributes, ordered by name.
pub type AttributeMap = BTreeMap<String, AttributeValue>;

/// Typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Int(i64),
    Double(f64),
    Bool(bool),
    String(String),
}

impl AttributeValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::Int(_) => "int",
            AttributeValue::Double(_) => "double",
            AttributeValue::Bool(_) => "bool",
            AttributeValue::String(_) => "string",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            AttributeValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(v) => Some(v),
            _ => None,
        }
    }

    /// Numeric view used for range checks.
    fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Int(v) => Some(*v as f64),
            AttributeValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    fn same_type(&self, other: &AttributeValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Parse an opaque configuration parameter: integer, then float, then bool, else string.
    pub fn parse_param(raw: &str) -> Self {
        let s = raw.trim();
        if let Ok(v) = s.parse::<i64>() {
            return AttributeValue::Int(v);
        }
        if let Ok(v) = s.parse::<f64>() {
            return AttributeValue::Double(v);
        }
        match s {
            "true" => AttributeValue::Bool(true),
            "false" => AttributeValue::Bool(false),
            _ => AttributeValue::String(raw.to_string()),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Int(v) => write!(f, "{v}"),
            AttributeValue::Double(v) => write!(f, "{v}"),
            AttributeValue::Bool(v) => write!(f, "{v}"),
            AttributeValue::String(v) => write!(f, "\"{v}\""),
        }
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<i32> for AttributeValue {
    fn from(v: i32) -> Self {
        AttributeValue::Int(v as i64)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Double(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::String(v)
    }
}

/// Constraint declared with an attribute.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Constraint {
    #[default]
    None,
    AllowedValues(Vec<AttributeValue>),
    /// Inclusive numeric range; only Int and Double attributes satisfy it.
    Range { min: f64, max: f64 },
}

impl Constraint {
    /// Check `value` against the constraint. Returns the rejection reason on failure.
    pub fn check(&self, value: &AttributeValue) -> std::result::Result<(), String> {
        match self {
            Constraint::None => Ok(()),
            Constraint::AllowedValues(allowed) => {
                if allowed.contains(value) {
                    Ok(())
                } else {
                    Err(format!("{value} is not an allowed value"))
                }
            }
            Constraint::Range { min, max } => match value.as_number() {
                Some(n) if n >= *min && n <= *max => Ok(()),
                Some(_) => Err(format!("{value} is outside [{min}, {max}]")),
                None => Err(format!("{} value cannot satisfy a range", value.type_name())),
            },
        }
    }

    /// Check that the constraint itself can be declared. An empty allowed list
    /// is accepted and leaves automation nothing to iterate.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Constraint::Range { min, max } => range_len(*min, *max)
                .map(|_| ())
                .ok_or_else(|| format!("range [{min}, {max}] cannot be stepped by 1")),
            _ => Ok(()),
        }
    }

    /// Check a declaration: the constraint, then the initial value.
    fn admit(&self, value: &AttributeValue) -> std::result::Result<(), String> {
        self.validate()?;
        match self {
            Constraint::AllowedValues(allowed) if allowed.is_empty() => Ok(()),
            _ => self.check(value),
        }
    }

    /// Values an automation walks through for an attribute currently holding `current`.
    pub fn value_sequence(&self, current: &AttributeValue) -> Vec<AttributeValue> {
        match self {
            Constraint::None => Vec::new(),
            Constraint::AllowedValues(allowed) => allowed.clone(),
            Constraint::Range { min, max } => {
                let Some(len) = range_len(*min, *max) else {
                    return Vec::new();
                };
                match current {
                    AttributeValue::Int(_) => {
                        let lo = min.ceil() as i64;
                        let hi = max.floor() as i64;
                        (lo..=hi).map(AttributeValue::Int).collect()
                    }
                    AttributeValue::Double(_) => (0..len)
                        .map(|i| AttributeValue::Double(min + i as f64))
                        .collect(),
                    _ => Vec::new(),
                }
            }
        }
    }
}

/// Longest value sequence a range may produce.
pub const MAX_RANGE_STEPS: u64 = 1 << 16;

/// Above this magnitude adding 1.0 to an f64 may not change it.
const MAX_EXACT_STEP: f64 = 9_007_199_254_740_992.0;

/// Number of unit steps from `min` up to `max`, or `None` when the range is
/// empty, not finite, too coarse to step by 1, or longer than [`MAX_RANGE_STEPS`].
fn range_len(min: f64, max: f64) -> Option<u64> {
    if !min.is_finite() || !max.is_finite() || max < min {
        return None;
    }
    if min.abs() >= MAX_EXACT_STEP || max.abs() >= MAX_EXACT_STEP {
        return None;
    }
    let steps = (max - min).floor();
    if steps >= MAX_RANGE_STEPS as f64 {
        return None;
    }
    Some(steps as u64 + 1)
}

/// One declared attribute: current value plus constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDefinition {
    pub name: String,
    pub value: AttributeValue,
    pub constraint: Constraint,
}

/// Attributes of a single resource, kept in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeStore {
    attributes: Vec<AttributeDefinition>,
}

impl AttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from opaque key/value configuration parameters (no constraints).
    /// Keys are declared in sorted order so the result is deterministic.
    pub fn from_params(params: &HashMap<String, String>) -> Self {
        let mut keys: Vec<&String> = params.keys().collect();
        keys.sort();
        let attributes = keys
            .into_iter()
            .map(|k| AttributeDefinition {
                name: k.clone(),
                value: AttributeValue::parse_param(&params[k]),
                constraint: Constraint::None,
            })
            .collect();
        Self { attributes }
    }

    /// Declare an attribute. Re-declaring replaces value and constraint in place.
    pub fn declare(
        &mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
        constraint: Constraint,
    ) -> Result<()> {
        let name = name.into();
        let value = value.into();
        constraint
            .admit(&value)
            .map_err(|reason| Error::invalid_value(&name, reason))?;
        match self.attributes.iter_mut().find(|a| a.name == name) {
            Some(existing) => {
                existing.value = value;
                existing.constraint = constraint;
            }
            None => self.attributes.push(AttributeDefinition {
                name,
                value,
                constraint,
            }),
        }
        Ok(())
    }

    /// Replace the constraint of an already declared attribute.
    pub fn set_constraint(&mut self, name: &str, constraint: Constraint) -> Result<()> {
        let def = self.definition_mut(name)?;
        constraint
            .admit(&def.value)
            .map_err(|reason| Error::invalid_value(name, reason))?;
        def.constraint = constraint;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.definition(name).map(|d| &d.value)
    }

    pub fn definition(&self, name: &str) -> Option<&AttributeDefinition> {
        self.attributes.iter().find(|a| a.name == name)
    }

    fn definition_mut(&mut self, name: &str) -> Result<&mut AttributeDefinition> {
        self.attributes
            .iter_mut()
            .find(|a| a.name == name)
            .ok_or_else(|| Error::UnknownAttribute(name.to_string()))
    }

    /// Declarations in declaration order.
    pub fn definitions(&self) -> impl Iterator<Item = &AttributeDefinition> {
        self.attributes.iter()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn snapshot(&self) -> AttributeMap {
        self.attributes
            .iter()
            .map(|a| (a.name.clone(), a.value.clone()))
            .collect()
    }

    fn validate(&self, name: &str, value: &AttributeValue) -> Result<()> {
        let def = self
            .definition(name)
            .ok_or_else(|| Error::UnknownAttribute(name.to_string()))?;
        if !def.value.same_type(value) {
            return Err(Error::invalid_value(
                name,
                format!(
                    "expected {}, got {}",
                    def.value.type_name(),
                    value.type_name()
                ),
            ));
        }
        def.constraint
            .check(value)
            .map_err(|reason| Error::invalid_value(name, reason))
    }

    /// Local update path: validate and apply a single value. Returns true if the value changed.
    pub fn set(&mut self, name: &str, value: AttributeValue) -> Result<bool> {
        self.validate(name, &value)?;
        let def = self.definition_mut(name)?;
        if def.value == value {
            return Ok(false);
        }
        def.value = value;
        Ok(true)
    }

    /// Validate every entry first, then apply all of them. Nothing is applied on failure.
    pub fn set_all(&mut self, values: &AttributeMap) -> Result<AttributeMap> {
        for (name, value) in values {
            self.validate(name, value)?;
        }
        for (name, value) in values {
            self.definition_mut(name)?.value = value.clone();
        }
        Ok(values.clone())
    }

    /// Values automation iterates for one attribute.
    pub fn value_sequence(&self, name: &str) -> Result<Vec<AttributeValue>> {
        let def = self
            .definition(name)
            .ok_or_else(|| Error::UnknownAttribute(name.to_string()))?;
        Ok(def.constraint.value_sequence(&def.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn light_store() -> AttributeStore {
        let mut store = AttributeStore::new();
        store
            .declare(
                "power",
                "off",
                Constraint::AllowedValues(vec!["on".into(), "off".into()]),
            )
            .unwrap();
        store
            .declare(
                "brightness",
                50,
                Constraint::Range {
                    min: 0.0,
                    max: 100.0,
                },
            )
            .unwrap();
        store
    }

    #[test]
    fn set_validates_constraints() {
        let mut store = light_store();
        assert_eq!(store.set("power", "on".into()), Ok(true));
        assert_eq!(store.set("power", "on".into()), Ok(false));
        assert!(matches!(
            store.set("power", "dim".into()),
            Err(Error::InvalidAttributeValue { .. })
        ));
        assert!(matches!(
            store.set("brightness", 101.into()),
            Err(Error::InvalidAttributeValue { .. })
        ));
        assert!(matches!(
            store.set("brightness", "high".into()),
            Err(Error::InvalidAttributeValue { .. })
        ));
        assert_eq!(
            store.set("color", "red".into()),
            Err(Error::UnknownAttribute("color".into()))
        );
    }

    #[test]
    fn set_all_is_all_or_nothing() {
        let mut store = light_store();
        let mut update = AttributeMap::new();
        update.insert("power".into(), "on".into());
        update.insert("brightness".into(), 250.into());
        assert!(store.set_all(&update).is_err());
        assert_eq!(store.get("power"), Some(&AttributeValue::from("off")));
        assert_eq!(store.get("brightness"), Some(&AttributeValue::Int(50)));

        update.insert("brightness".into(), 80.into());
        let applied = store.set_all(&update).unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(store.get("brightness"), Some(&AttributeValue::Int(80)));
    }

    #[test]
    fn declare_rejects_initial_value_outside_constraint() {
        let mut store = AttributeStore::new();
        let err = store
            .declare("level", 5, Constraint::Range { min: 10.0, max: 20.0 })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAttributeValue { key, .. } if key == "level"));
        assert!(store.is_empty());
    }

    #[test]
    fn from_params_parses_types() {
        let mut params = HashMap::new();
        params.insert("Temperature".to_string(), "21".to_string());
        params.insert("humidity".to_string(), "40.5".to_string());
        params.insert("on".to_string(), "true".to_string());
        params.insert("name".to_string(), "kitchen".to_string());
        let store = AttributeStore::from_params(&params);
        assert_eq!(store.get("Temperature"), Some(&AttributeValue::Int(21)));
        assert_eq!(store.get("humidity"), Some(&AttributeValue::Double(40.5)));
        assert_eq!(store.get("on"), Some(&AttributeValue::Bool(true)));
        assert_eq!(store.get("name"), Some(&AttributeValue::from("kitchen")));
        let names: Vec<_> = store.definitions().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Temperature", "humidity", "name", "on"]);
    }

    #[test]
    fn range_sequences_follow_value_type() {
        let ints = Constraint::Range { min: 1.0, max: 3.0 }.value_sequence(&1.into());
        assert_eq!(
            ints,
            vec![
                AttributeValue::Int(1),
                AttributeValue::Int(2),
                AttributeValue::Int(3)
            ]
        );
        let doubles = Constraint::Range { min: 0.5, max: 2.0 }.value_sequence(&1.0.into());
        assert_eq!(
            doubles,
            vec![AttributeValue::Double(0.5), AttributeValue::Double(1.5)]
        );
        assert!(Constraint::None
            .value_sequence(&AttributeValue::Int(1))
            .is_empty());
    }

    #[test]
    fn coarse_or_huge_ranges_are_rejected() {
        let mut store = AttributeStore::new();
        let coarse = Constraint::Range {
            min: 1e16,
            max: 1e16 + 4.0,
        };
        assert!(matches!(
            store.declare("energy", 1e16, coarse.clone()),
            Err(Error::InvalidAttributeValue { .. })
        ));
        assert!(coarse.value_sequence(&AttributeValue::Double(1e16)).is_empty());

        let huge = Constraint::Range {
            min: -1e18,
            max: 1e18,
        };
        assert!(store.declare("counter", 0, huge.clone()).is_err());
        assert!(huge.value_sequence(&AttributeValue::Int(0)).is_empty());

        store.declare("counter", 0, Constraint::None).unwrap();
        assert!(store.set_constraint("counter", huge).is_err());
        assert_eq!(
            store.definition("counter").map(|d| &d.constraint),
            Some(&Constraint::None)
        );
        let nan = Constraint::Range {
            min: f64::NAN,
            max: 1.0,
        };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn largest_allowed_range_is_bounded() {
        let max = MAX_RANGE_STEPS as f64 - 1.0;
        let range = Constraint::Range { min: 0.0, max };
        assert!(range.validate().is_ok());
        assert_eq!(
            range.value_sequence(&AttributeValue::Double(0.0)).len() as u64,
            MAX_RANGE_STEPS
        );
        assert!(Constraint::Range { min: 0.0, max: max + 1.0 }.validate().is_err());
    }

    #[test]
    fn empty_allowed_list_can_be_declared() {
        let mut store = AttributeStore::new();
        store
            .declare("mode", 1, Constraint::AllowedValues(vec![]))
            .unwrap();
        assert_eq!(store.value_sequence("mode").unwrap(), Vec::new());
        // Nothing is allowed, so the value cannot change.
        assert!(store.set("mode", 2.into()).is_err());
        store.declare("label", "x", Constraint::None).unwrap();
        store
            .set_constraint("label", Constraint::AllowedValues(vec![]))
            .unwrap();
    }

    #[test]
    fn declaration_order_is_kept() {
        let store = light_store();
        let names: Vec<_> = store.definitions().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["power", "brightness"]);
        assert_eq!(store.value_sequence("power").unwrap().len(), 2);
        assert_eq!(store.value_sequence("brightness").unwrap().len(), 101);
    }
}
