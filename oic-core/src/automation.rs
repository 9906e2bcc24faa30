//! Automation: value sequences over declared attributes, and the job registry
//! that enforces one resource-level job per resource.

use std::collections::HashMap;

use crate::attributes::{AttributeStore, AttributeValue};
use crate::error::{Error, Result};

pub type AutomationId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomationType {
    /// Walk the value sequence once, then complete with Success.
    OneShot,
    /// Restart the sequence until stopped.
    Recurring,
}

/// Final status delivered to the completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomationStatus {
    Success,
    Stopped,
}

/// What a job mutates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AutomationScope {
    Resource,
    Attribute(String),
}

/// One value application.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStep {
    pub attribute: String,
    pub value: AttributeValue,
}

/// Cursor over the steps of a job.
#[derive(Debug, Clone)]
pub struct AutomationSequence {
    steps: Vec<UpdateStep>,
    kind: AutomationType,
    position: usize,
}

impl AutomationSequence {
    /// Every value of every attribute, attributes in declaration order.
    pub fn for_resource(store: &AttributeStore, kind: AutomationType) -> Self {
        let steps = store
            .definitions()
            .flat_map(|def| {
                def.constraint
                    .value_sequence(&def.value)
                    .into_iter()
                    .map(move |value| UpdateStep {
                        attribute: def.name.clone(),
                        value,
                    })
            })
            .collect();
        Self {
            steps,
            kind,
            position: 0,
        }
    }

    /// Every value of one attribute.
    pub fn for_attribute(store: &AttributeStore, name: &str, kind: AutomationType) -> Result<Self> {
        let steps = store
            .value_sequence(name)?
            .into_iter()
            .map(|value| UpdateStep {
                attribute: name.to_string(),
                value,
            })
            .collect();
        Ok(Self {
            steps,
            kind,
            position: 0,
        })
    }

    pub fn kind(&self) -> AutomationType {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Next value to apply. `None` ends the job: a one-shot sequence is
    /// exhausted, or the sequence is empty (for either type).
    pub fn next_step(&mut self) -> Option<UpdateStep> {
        if self.steps.is_empty() {
            return None;
        }
        if self.position >= self.steps.len() {
            match self.kind {
                AutomationType::OneShot => return None,
                AutomationType::Recurring => self.position = 0,
            }
        }
        let step = self.steps[self.position].clone();
        self.position += 1;
        Some(step)
    }
}

/// Active jobs by id; rejects conflicting starts.
#[derive(Debug)]
pub struct AutomationRegistry {
    next_id: AutomationId,
    active: HashMap<AutomationId, (String, AutomationScope)>,
}

impl Default for AutomationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AutomationRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            active: HashMap::new(),
        }
    }

    /// Reserve an id for a job on `resource_uri`. A second resource-level job on
    /// one resource, or a second job on one attribute, is refused.
    pub fn register(&mut self, resource_uri: &str, scope: AutomationScope) -> Result<AutomationId> {
        let conflict = self
            .active
            .values()
            .any(|(uri, s)| uri == resource_uri && *s == scope);
        if conflict {
            let target = match &scope {
                AutomationScope::Resource => resource_uri.to_string(),
                AutomationScope::Attribute(name) => format!("{resource_uri}#{name}"),
            };
            return Err(Error::AutomationAlreadyInProgress(target));
        }
        // Ids wrap; skip any still held by a running job.
        let mut id = self.next_id;
        while self.active.contains_key(&id) {
            id = id.wrapping_add(1).max(1);
        }
        self.next_id = id.wrapping_add(1).max(1);
        self.active.insert(id, (resource_uri.to_string(), scope));
        Ok(id)
    }

    pub fn unregister(&mut self, id: AutomationId) -> bool {
        self.active.remove(&id).is_some()
    }

    pub fn is_active(&self, id: AutomationId) -> bool {
        self.active.contains_key(&id)
    }

    /// Ids of jobs running against one resource.
    pub fn jobs_for(&self, resource_uri: &str) -> Vec<AutomationId> {
        let mut ids: Vec<AutomationId> = self
            .active
            .iter()
            .filter(|(_, (uri, _))| uri == resource_uri)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn ids(&self) -> Vec<AutomationId> {
        let mut ids: Vec<AutomationId> = self.active.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::Constraint;

    fn store() -> AttributeStore {
        let mut s = AttributeStore::new();
        s.declare(
            "power",
            "off",
            Constraint::AllowedValues(vec!["on".into(), "off".into()]),
        )
        .unwrap();
        s.declare("level", 1, Constraint::Range { min: 1.0, max: 3.0 })
            .unwrap();
        s.declare("label", "x", Constraint::None).unwrap();
        s.declare("mode", 1, Constraint::AllowedValues(vec![])).unwrap();
        s
    }

    #[test]
    fn resource_sequence_in_declaration_order() {
        let mut seq = AutomationSequence::for_resource(&store(), AutomationType::OneShot);
        assert_eq!(seq.len(), 5);
        let steps: Vec<_> = std::iter::from_fn(|| seq.next_step())
            .map(|s| (s.attribute, s.value))
            .collect();
        assert_eq!(
            steps,
            vec![
                ("power".to_string(), AttributeValue::from("on")),
                ("power".to_string(), AttributeValue::from("off")),
                ("level".to_string(), AttributeValue::Int(1)),
                ("level".to_string(), AttributeValue::Int(2)),
                ("level".to_string(), AttributeValue::Int(3)),
            ]
        );
        assert!(seq.next_step().is_none());
    }

    #[test]
    fn recurring_wraps_around() {
        let mut seq =
            AutomationSequence::for_attribute(&store(), "power", AutomationType::Recurring)
                .unwrap();
        let values: Vec<_> = (0..5).filter_map(|_| seq.next_step()).map(|s| s.value).collect();
        assert_eq!(
            values,
            vec![
                AttributeValue::from("on"),
                AttributeValue::from("off"),
                AttributeValue::from("on"),
                AttributeValue::from("off"),
                AttributeValue::from("on"),
            ]
        );
    }

    #[test]
    fn empty_sequence_ends_immediately() {
        for name in ["mode", "label"] {
            let mut seq =
                AutomationSequence::for_attribute(&store(), name, AutomationType::OneShot).unwrap();
            assert!(seq.is_empty());
            assert!(seq.next_step().is_none());
            let mut seq =
                AutomationSequence::for_attribute(&store(), name, AutomationType::Recurring)
                    .unwrap();
            assert!(seq.next_step().is_none());
        }
    }

    #[test]
    fn unknown_attribute_is_error() {
        assert!(matches!(
            AutomationSequence::for_attribute(&store(), "nope", AutomationType::OneShot),
            Err(Error::UnknownAttribute(_))
        ));
    }

    #[test]
    fn registry_conflicts() {
        let mut reg = AutomationRegistry::new();
        let a = reg.register("/a/light", AutomationScope::Resource).unwrap();
        assert!(matches!(
            reg.register("/a/light", AutomationScope::Resource),
            Err(Error::AutomationAlreadyInProgress(_))
        ));
        // Different resource, and attribute jobs, are independent.
        let b = reg.register("/a/fan", AutomationScope::Resource).unwrap();
        let c = reg
            .register("/a/light", AutomationScope::Attribute("power".into()))
            .unwrap();
        let d = reg
            .register("/a/light", AutomationScope::Attribute("level".into()))
            .unwrap();
        assert!(reg
            .register("/a/light", AutomationScope::Attribute("power".into()))
            .is_err());
        assert_eq!(reg.jobs_for("/a/light"), vec![a, c, d]);
        assert!(reg.unregister(a));
        assert!(!reg.unregister(a));
        assert!(reg.register("/a/light", AutomationScope::Resource).is_ok());
        assert!(reg.is_active(b));
    }

    #[test]
    fn wrapped_ids_skip_running_jobs() {
        let mut reg = AutomationRegistry::new();
        let first = reg.register("/a/light", AutomationScope::Resource).unwrap();
        assert_eq!(first, 1);
        reg.next_id = AutomationId::MAX;
        let last = reg.register("/a/fan", AutomationScope::Resource).unwrap();
        assert_eq!(last, AutomationId::MAX);
        let wrapped = reg.register("/a/door", AutomationScope::Resource).unwrap();
        assert_eq!(wrapped, 2);
        assert_eq!(reg.ids(), vec![1, 2, AutomationId::MAX]);
        assert_eq!(reg.jobs_for("/a/light"), vec![first]);
    }
}
