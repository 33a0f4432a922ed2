//! Guest value model
//!
//! [`Value`] is a tagged sum; the heap-bearing variants (strings, tables,
//! arrays, closures, userdata) are `Arc` handles, so copying a value into a
//! register, local, global, or container is a refcount bump. Tables and
//! arrays are interior-mutable behind an `RwLock` since the surface language
//! mutates them through shared handles.
//!
//! Values created by the engine carry a [`MemoryCharge`] against the
//! engine's tracker and give the bytes back when the last handle drops.
//! Host-created values may be untracked.
//!
//! Equality is tag-then-value: numbers by `==`, strings by bytes, nils
//! always equal. Tables, arrays, closures, and natives compare by handle
//! identity; structural equality is deliberately not defined.

use crate::bytecode::FunctionInfo;
use crate::error::ExecError;
use crate::memory::{MemoryCharge, MemoryTracker};
use crate::native::NativeFunction;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, PoisonError, RwLock};

/// Accounted base cost of a table or array, before entries.
const CONTAINER_BASE_COST: usize = 64;

/// Accounted base cost of a closure, before upvalues.
const CLOSURE_BASE_COST: usize = 64;

fn entry_cost(key: &str) -> usize {
    key.len() + mem::size_of::<String>() + mem::size_of::<Value>()
}

fn slot_cost() -> usize {
    mem::size_of::<Value>()
}

/// Immutable string payload.
///
/// The compiler's constant pool and every runtime string share this type;
/// `load_const` hands out another handle to the pooled payload rather than
/// duplicating bytes. Any operation that builds new text (concat, substr,
/// case mapping) produces a fresh tracked payload.
#[derive(Debug)]
pub struct GhostStr {
    text: Box<str>,
    // Held for its Drop, which returns the bytes.
    #[allow(dead_code)]
    charge: MemoryCharge,
}

impl GhostStr {
    /// A string outside the engine's memory accounting.
    pub fn untracked(text: impl Into<String>) -> Arc<Self> {
        Arc::new(GhostStr {
            text: text.into().into_boxed_str(),
            charge: MemoryCharge::untracked(),
        })
    }

    /// A string charged byte-for-byte against `tracker`.
    pub fn tracked(tracker: &Arc<MemoryTracker>, text: impl Into<String>) -> Result<Arc<Self>, ExecError> {
        let text: String = text.into();
        let charge = MemoryCharge::charge(tracker, text.len())?;
        Ok(Arc::new(GhostStr {
            text: text.into_boxed_str(),
            charge,
        }))
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Byte length.
    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl PartialEq for GhostStr {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for GhostStr {}

/// String-keyed mapping with handle semantics.
#[derive(Debug)]
pub struct Table {
    entries: RwLock<HashMap<String, Value>>,
    charge: MemoryCharge,
}

impl Table {
    pub fn untracked() -> Arc<Self> {
        Arc::new(Table {
            entries: RwLock::new(HashMap::new()),
            charge: MemoryCharge::untracked(),
        })
    }

    pub fn tracked(tracker: &Arc<MemoryTracker>) -> Result<Arc<Self>, ExecError> {
        let charge = MemoryCharge::charge(tracker, CONTAINER_BASE_COST)?;
        Ok(Arc::new(Table {
            entries: RwLock::new(HashMap::new()),
            charge,
        }))
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    /// Insert under a duplicated key, charging for new entries.
    pub fn insert(&self, key: &str, value: Value) -> Result<(), ExecError> {
        let mut entries = self.write();
        if !entries.contains_key(key) {
            self.charge.grow(entry_cost(key))?;
        }
        entries.insert(key.to_string(), value);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let removed = self.write().remove(key);
        if removed.is_some() {
            self.charge.shrink(entry_cost(key));
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    /// Entries copied out for iteration, stable for the duration of a loop.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Value>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Value>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Dense 0-indexed sequence with handle semantics.
///
/// Writes keep the array dense: in-range indices overwrite, an index equal
/// to the length appends, and anything past that is ignored.
#[derive(Debug)]
pub struct Array {
    items: RwLock<Vec<Value>>,
    charge: MemoryCharge,
}

impl Array {
    pub fn untracked() -> Arc<Self> {
        Arc::new(Array {
            items: RwLock::new(Vec::new()),
            charge: MemoryCharge::untracked(),
        })
    }

    pub fn tracked(tracker: &Arc<MemoryTracker>) -> Result<Arc<Self>, ExecError> {
        let charge = MemoryCharge::charge(tracker, CONTAINER_BASE_COST)?;
        Ok(Arc::new(Array {
            items: RwLock::new(Vec::new()),
            charge,
        }))
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.read().get(index).cloned()
    }

    /// Dense store; see the type docs for the edge rules.
    pub fn set(&self, index: usize, value: Value) -> Result<(), ExecError> {
        let mut items = self.write();
        if index < items.len() {
            items[index] = value;
        } else if index == items.len() {
            self.charge.grow(slot_cost())?;
            items.push(value);
        }
        Ok(())
    }

    pub fn push(&self, value: Value) -> Result<(), ExecError> {
        self.charge.grow(slot_cost())?;
        self.write().push(value);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Value>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Value>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A callable bundling a function-table index with captured upvalues.
///
/// The handle keeps the whole function table alive, so a closure stored in
/// an engine global stays callable after the script that compiled it is
/// dropped. Upvalues are values captured at creation, not cells.
#[derive(Debug)]
pub struct Closure {
    pub functions: Arc<Vec<FunctionInfo>>,
    pub index: usize,
    pub upvalues: Vec<Value>,
    // Held for its Drop, which returns the bytes.
    #[allow(dead_code)]
    charge: MemoryCharge,
}

impl Closure {
    pub fn untracked(functions: Arc<Vec<FunctionInfo>>, index: usize, upvalues: Vec<Value>) -> Arc<Self> {
        Arc::new(Closure {
            functions,
            index,
            upvalues,
            charge: MemoryCharge::untracked(),
        })
    }

    pub fn tracked(
        tracker: &Arc<MemoryTracker>,
        functions: Arc<Vec<FunctionInfo>>,
        index: usize,
        upvalues: Vec<Value>,
    ) -> Result<Arc<Self>, ExecError> {
        let charge =
            MemoryCharge::charge(tracker, CLOSURE_BASE_COST + upvalues.len() * slot_cost())?;
        Ok(Arc::new(Closure {
            functions,
            index,
            upvalues,
            charge,
        }))
    }

    pub fn info(&self) -> Option<&FunctionInfo> {
        self.functions.get(self.index)
    }

    /// Function name, or a placeholder when the index is stale.
    pub fn name(&self) -> &str {
        self.info().map(|f| f.name.as_str()).unwrap_or("<closure>")
    }
}

/// Opaque host payload with a type name.
///
/// The payload's own `Drop` is the destructor; the handle is shared, never
/// copied.
pub struct Userdata {
    type_name: Box<str>,
    data: Box<dyn Any + Send + Sync>,
}

impl Userdata {
    pub fn new(type_name: impl Into<String>, data: impl Any + Send + Sync) -> Arc<Self> {
        Arc::new(Userdata {
            type_name: type_name.into().into_boxed_str(),
            data: Box::new(data),
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }
}

impl fmt::Debug for Userdata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Userdata({})", self.type_name)
    }
}

/// A guest value.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Str(Arc<GhostStr>),
    Table(Arc<Table>),
    Array(Arc<Array>),
    Closure(Arc<Closure>),
    Native(NativeFunction),
    Userdata(Arc<Userdata>),
}

impl Value {
    /// Untracked string convenience, mostly for hosts and tests.
    pub fn string(text: impl Into<String>) -> Self {
        Value::Str(GhostStr::untracked(text))
    }

    /// Conditional classification.
    ///
    /// This engine keeps the legacy rule: `nil`, `false`, and the number
    /// `0` are falsy; everything else (including `""` and empty containers)
    /// is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            _ => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Table(_) => "table",
            Value::Array(_) => "array",
            Value::Closure(_) => "function",
            Value::Native(_) => "function",
            Value::Userdata(_) => "userdata",
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => Arc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => a == b,
            (Value::Userdata(a), Value::Userdata(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{n}")
                }
            }
            Value::Str(s) => f.write_str(s.as_str()),
            Value::Table(t) => write!(f, "<table:{}>", t.len()),
            Value::Array(a) => write!(f, "<array:{}>", a.len()),
            Value::Closure(c) => write!(f, "<function:{}>", c.name()),
            Value::Native(n) => write!(f, "<native:{}>", n.name()),
            Value::Userdata(u) => write!(f, "<userdata:{}>", u.type_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness_legacy_rule() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(Value::Number(1.0).is_truthy());
        assert!(Value::string("").is_truthy());
        assert!(Value::Table(Table::untracked()).is_truthy());
    }

    #[test]
    fn test_equality_by_tag_then_value() {
        assert_eq!(Value::Nil, Value::Nil);
        assert_eq!(Value::Number(2.0), Value::Number(2.0));
        assert_ne!(Value::Number(0.0), Value::Bool(false));
        assert_eq!(Value::string("abc"), Value::string("abc"));

        let t = Table::untracked();
        assert_eq!(Value::Table(Arc::clone(&t)), Value::Table(Arc::clone(&t)));
        assert_ne!(Value::Table(t), Value::Table(Table::untracked()));
    }

    #[test]
    fn test_table_memory_charges_follow_entries() {
        let tracker = Arc::new(MemoryTracker::new(4096));
        {
            let table = Table::tracked(&tracker).unwrap();
            table.insert("alpha", Value::Number(1.0)).unwrap();
            table.insert("beta", Value::Number(2.0)).unwrap();
            // Overwrites do not grow the charge.
            table.insert("alpha", Value::Number(3.0)).unwrap();
            assert!(tracker.bytes_in_use() > CONTAINER_BASE_COST);
            table.remove("beta");
            assert_eq!(table.len(), 1);
        }
        assert_eq!(tracker.bytes_in_use(), 0);
    }

    #[test]
    fn test_array_dense_store_rules() {
        let arr = Array::untracked();
        arr.push(Value::Number(1.0)).unwrap();
        arr.set(0, Value::Number(9.0)).unwrap();
        // Appending at len extends; past len is ignored.
        arr.set(1, Value::Number(2.0)).unwrap();
        arr.set(10, Value::Number(99.0)).unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr.get(0), Some(Value::Number(9.0)));
        assert_eq!(arr.get(10), None);
    }

    #[test]
    fn test_string_charge_is_byte_length() {
        let tracker = Arc::new(MemoryTracker::new(64));
        let s = GhostStr::tracked(&tracker, "hello").unwrap();
        assert_eq!(tracker.bytes_in_use(), 5);
        drop(s);
        assert_eq!(tracker.bytes_in_use(), 0);
        assert!(GhostStr::tracked(&tracker, "x".repeat(65)).is_err());
    }

    #[test]
    fn test_display_formats_integral_numbers_bare() {
        assert_eq!(Value::Number(20.0).to_string(), "20");
        assert_eq!(Value::Number(2.5).to_string(), "2.5");
        assert_eq!(Value::Nil.to_string(), "nil");
    }
}
