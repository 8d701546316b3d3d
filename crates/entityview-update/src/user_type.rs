//! Opaque mutable attribute values and the "basic user type" hook.
//!
//! A [`UserValue`] is any application value stored in a BASIC attribute that
//! is not a plain [`Value`]. Without a registered [`BasicUserType`] the
//! engine can copy such a value but cannot prove it unchanged after it was
//! handed out mutably, so flushing it goes through reload-and-diff. A
//! registered type supplies deep cloning and deep equality so dirtiness is
//! decided in memory.

use entityview_core::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::Arc;

/// An application value held by a BASIC attribute.
pub trait UserValue: Debug + Send + Sync + 'static {
    /// Name of the user type this value belongs to.
    fn type_name(&self) -> &str;

    /// Column representation written by a flush.
    fn to_value(&self) -> Value;

    /// Copy used for snapshots when no user type is registered.
    fn clone_box(&self) -> Box<dyn UserValue>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl Clone for Box<dyn UserValue> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Deep-clone and deep-equality capability for a user type.
pub trait BasicUserType: Debug + Send + Sync {
    /// Name matched against [`UserValue::type_name`] and attribute declarations.
    fn type_name(&self) -> &str;

    /// Independent copy taken as the initial snapshot.
    fn deep_clone(&self, value: &dyn UserValue) -> Box<dyn UserValue>;

    /// Whether two values hold the same state.
    fn is_deep_equal(&self, a: &dyn UserValue, b: &dyn UserValue) -> bool;

    /// Decode a column value, used when materializing fetched rows.
    fn from_value(&self, _value: &Value) -> Option<Box<dyn UserValue>> {
        None
    }
}

/// [`BasicUserType`] for any `Clone + PartialEq` user value.
pub struct CloneEqType<T> {
    name: String,
    decode: Option<fn(&Value) -> Option<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CloneEqType<T> {
    /// Create the type under the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            decode: None,
            _marker: PhantomData,
        }
    }

    /// Decoder for fetched column values.
    pub fn with_decoder(mut self, decode: fn(&Value) -> Option<T>) -> Self {
        self.decode = Some(decode);
        self
    }
}

impl<T> Debug for CloneEqType<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloneEqType")
            .field("name", &self.name)
            .field("type", &std::any::type_name::<T>())
            .field("decodes", &self.decode.is_some())
            .finish()
    }
}

impl<T: UserValue + Clone + PartialEq> BasicUserType for CloneEqType<T> {
    fn type_name(&self) -> &str {
        &self.name
    }

    fn deep_clone(&self, value: &dyn UserValue) -> Box<dyn UserValue> {
        match value.as_any().downcast_ref::<T>() {
            Some(v) => Box::new(v.clone()),
            None => value.clone_box(),
        }
    }

    fn is_deep_equal(&self, a: &dyn UserValue, b: &dyn UserValue) -> bool {
        match (a.as_any().downcast_ref::<T>(), b.as_any().downcast_ref::<T>()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn from_value(&self, value: &Value) -> Option<Box<dyn UserValue>> {
        let decode = self.decode?;
        decode(value).map(|v| Box::new(v) as Box<dyn UserValue>)
    }
}

/// Registered user types keyed by name.
#[derive(Debug, Clone, Default)]
pub struct UserTypeRegistry {
    types: HashMap<String, Arc<dyn BasicUserType>>,
}

impl UserTypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type, replacing any previous one with the same name.
    pub fn register(&mut self, user_type: impl BasicUserType + 'static) {
        let name = user_type.type_name().to_string();
        tracing::debug!(user_type = %name, "Registering basic user type");
        self.types.insert(name, Arc::new(user_type));
    }

    /// Look up a type.
    pub fn get(&self, name: &str) -> Option<Arc<dyn BasicUserType>> {
        self.types.get(name).cloned()
    }

    /// Whether a type is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether no type is registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
