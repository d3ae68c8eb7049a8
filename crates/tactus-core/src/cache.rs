//! Per-unit variable cache.
//!
//! Built once when a unit attaches, from its declared variable descriptors,
//! and reused every step. The reference set is immutable for the unit's
//! lifetime; only the value held in a slot changes. Outputs are enumerated
//! in registration order, which fixes the `StepResponse` layout.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tactus_proto::{Value, ValueKind, Variable};
use thiserror::Error;

/// Whether a variable is consumed or produced by the unit during a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Causality {
    /// Consumed: set from `StepRequest` inputs before the step.
    Input,
    /// Produced: read back after the step into the `StepResponse`.
    Output,
}

/// Declared descriptor of one exposed variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    /// Stable value reference, unique within the unit.
    pub reference: u32,
    /// Value kind, fixed for the lifetime of the reference.
    pub kind: ValueKind,
    /// Input or output causality.
    pub causality: Causality,
}

/// One cache slot: the descriptor plus the current value.
#[derive(Debug, Clone)]
pub struct Slot {
    /// Value reference.
    pub reference: u32,
    /// Fixed value kind.
    pub kind: ValueKind,
    /// Causality.
    pub causality: Causality,
    value: Value,
}

impl Slot {
    /// Current value held in the slot.
    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// Errors from building or updating the cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Two descriptors share a reference.
    #[error("duplicate value reference: {reference}")]
    DuplicateReference {
        /// The duplicated reference.
        reference: u32,
    },

    /// No slot exists for the reference.
    #[error("unknown value reference: {reference}")]
    UnknownReference {
        /// The unknown reference.
        reference: u32,
    },

    /// The value's kind does not match the slot's fixed kind.
    #[error("kind mismatch for reference {reference}: expected {expected}, got {actual}")]
    KindMismatch {
        /// The reference being updated.
        reference: u32,
        /// The slot's fixed kind.
        expected: ValueKind,
        /// The kind of the rejected value.
        actual: ValueKind,
    },
}

/// Reference → slot mapping with a stable output enumeration order.
#[derive(Debug, Clone)]
pub struct VariableCache {
    slots: Vec<Slot>,
    index: HashMap<u32, usize>,
    outputs: Vec<usize>,
}

impl VariableCache {
    /// Build the cache from declared descriptors.
    ///
    /// Slot values start at the zero value of their kind. Registration
    /// order of the descriptors fixes the output enumeration order.
    pub fn build(specs: &[VariableSpec]) -> Result<Self, CacheError> {
        let mut slots = Vec::with_capacity(specs.len());
        let mut index = HashMap::with_capacity(specs.len());
        let mut outputs = Vec::new();

        for spec in specs {
            if index.insert(spec.reference, slots.len()).is_some() {
                return Err(CacheError::DuplicateReference { reference: spec.reference });
            }
            if spec.causality == Causality::Output {
                outputs.push(slots.len());
            }
            slots.push(Slot {
                reference: spec.reference,
                kind: spec.kind,
                causality: spec.causality,
                value: Value::zero(spec.kind),
            });
        }

        Ok(Self { slots, index, outputs })
    }

    /// Number of registered references.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of output-causality references.
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Look up the slot for a reference.
    pub fn lookup(&self, reference: u32) -> Option<&Slot> {
        self.index.get(&reference).map(|&i| &self.slots[i])
    }

    /// Whether a reference exists and has output causality.
    pub fn is_output(&self, reference: u32) -> bool {
        self.lookup(reference).is_some_and(|slot| slot.causality == Causality::Output)
    }

    /// Update the value held for a reference.
    ///
    /// The kind of a slot never changes; a value of a different kind is
    /// rejected.
    pub fn set_value(&mut self, reference: u32, value: Value) -> Result<(), CacheError> {
        let &slot_index = self
            .index
            .get(&reference)
            .ok_or(CacheError::UnknownReference { reference })?;
        let slot = &mut self.slots[slot_index];

        if value.kind() != slot.kind {
            return Err(CacheError::KindMismatch {
                reference,
                expected: slot.kind,
                actual: value.kind(),
            });
        }

        slot.value = value;
        Ok(())
    }

    /// All slots in registration order.
    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    /// Output variables in registration order, with their current values.
    pub fn outputs(&self) -> impl Iterator<Item = Variable> + '_ {
        self.outputs.iter().map(|&i| {
            let slot = &self.slots[i];
            Variable::new(slot.reference, slot.value.clone())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn specs() -> Vec<VariableSpec> {
        vec![
            VariableSpec { reference: 10, kind: ValueKind::Real, causality: Causality::Output },
            VariableSpec { reference: 3, kind: ValueKind::Integer, causality: Causality::Input },
            VariableSpec { reference: 7, kind: ValueKind::Boolean, causality: Causality::Output },
            VariableSpec { reference: 1, kind: ValueKind::Real, causality: Causality::Input },
        ]
    }

    #[test]
    fn duplicate_reference_rejected() {
        let mut specs = specs();
        specs.push(specs[0]);

        assert_eq!(
            VariableCache::build(&specs).unwrap_err(),
            CacheError::DuplicateReference { reference: 10 }
        );
    }

    #[test]
    fn lookup_and_causality() {
        let cache = VariableCache::build(&specs()).unwrap();

        assert_eq!(cache.len(), 4);
        assert_eq!(cache.output_count(), 2);
        assert!(cache.is_output(10));
        assert!(cache.is_output(7));
        assert!(!cache.is_output(3));
        assert!(!cache.is_output(999));
        assert_eq!(cache.lookup(3).unwrap().kind, ValueKind::Integer);
        assert!(cache.lookup(999).is_none());
    }

    #[test]
    fn slots_start_at_zero() {
        let cache = VariableCache::build(&specs()).unwrap();
        assert_eq!(*cache.lookup(10).unwrap().value(), Value::Real(0.0));
        assert_eq!(*cache.lookup(7).unwrap().value(), Value::Boolean(false));
    }

    #[test]
    fn set_value_enforces_kind() {
        let mut cache = VariableCache::build(&specs()).unwrap();

        cache.set_value(3, Value::Integer(5)).unwrap();
        assert_eq!(*cache.lookup(3).unwrap().value(), Value::Integer(5));

        assert_eq!(
            cache.set_value(3, Value::Real(5.0)),
            Err(CacheError::KindMismatch {
                reference: 3,
                expected: ValueKind::Integer,
                actual: ValueKind::Real,
            })
        );
        assert_eq!(
            cache.set_value(999, Value::Real(0.0)),
            Err(CacheError::UnknownReference { reference: 999 })
        );
    }

    #[test]
    fn output_order_is_registration_order() {
        let mut cache = VariableCache::build(&specs()).unwrap();

        // Update outputs in reverse registration order; enumeration order
        // must not change.
        cache.set_value(7, Value::Boolean(true)).unwrap();
        cache.set_value(10, Value::Real(4.5)).unwrap();

        let outputs: Vec<Variable> = cache.outputs().collect();
        assert_eq!(
            outputs,
            vec![
                Variable::new(10, Value::Real(4.5)),
                Variable::new(7, Value::Boolean(true)),
            ]
        );
    }
}
