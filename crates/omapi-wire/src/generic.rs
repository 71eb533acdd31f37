//! The generic object: an ordered attribute list.

use crate::object::{Object, ObjectBehavior};
use crate::value::{TypedData, ValueWriter};
use omapi_types::OmapiResult;
use std::sync::Mutex;

/// Stores every value set on it. Setting an existing name replaces the value
/// in place; new names are appended, so values go out in insertion order.
#[derive(Default)]
pub struct GenericObject {
    values: Mutex<Vec<(String, TypedData)>>,
}

impl GenericObject {
    fn snapshot(&self) -> Vec<(String, TypedData)> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.values.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attribute names in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.snapshot().into_iter().map(|(name, _)| name).collect()
    }
}

impl ObjectBehavior for GenericObject {
    fn type_name(&self) -> &'static str {
        "generic"
    }

    fn set_value(&self, _this: &Object, name: &str, value: TypedData) -> OmapiResult<()> {
        let replaced = {
            let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
            match values.iter_mut().find(|(existing, _)| existing == name) {
                Some((_, slot)) => Some(std::mem::replace(slot, value)),
                None => {
                    values.push((name.to_string(), value));
                    None
                }
            }
        };
        // An old object value may release a chain; do it unlocked.
        drop(replaced);
        Ok(())
    }

    fn get_value(&self, this: &Object, name: &str) -> OmapiResult<TypedData> {
        let found = self
            .values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value.clone());
        match found {
            Some(value) => Ok(value),
            None => this.pass_get_value(name),
        }
    }

    fn stuff_values(&self, _this: &Object, out: &mut ValueWriter<'_>) -> OmapiResult<()> {
        for (name, value) in &self.snapshot() {
            out.put(name, value)?;
        }
        Ok(())
    }

    fn destroy(&self) {
        let values = std::mem::take(&mut *self.values.lock().unwrap_or_else(|e| e.into_inner()));
        drop(values);
    }
}
