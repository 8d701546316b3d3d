//! Attribute values held by view instances.

use crate::user_type::{BasicUserType, UserValue};
use crate::view::ViewInstance;
use crate::view_type::CollectionKind;
use entityview_core::Value;
use std::sync::Arc;

/// The live value of one attribute.
#[derive(Debug, Clone)]
pub enum AttributeValue {
    /// No value.
    Null,
    /// A plain column value.
    Basic(Value),
    /// A mutable application value.
    User(Box<dyn UserValue>),
    /// A nested view (embeddable or to-one target).
    View(Box<ViewInstance>),
    /// A collection.
    Collection(PluralCollection),
    /// A map.
    Map(PluralMap),
}

impl AttributeValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    pub fn as_basic(&self) -> Option<&Value> {
        match self {
            AttributeValue::Basic(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_view(&self) -> Option<&ViewInstance> {
        match self {
            AttributeValue::View(v) => Some(&**v),
            _ => None,
        }
    }

    pub fn as_view_mut(&mut self) -> Option<&mut ViewInstance> {
        match self {
            AttributeValue::View(v) => Some(&mut **v),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&PluralCollection> {
        match self {
            AttributeValue::Collection(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&PluralMap> {
        match self {
            AttributeValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_user(&self) -> Option<&dyn UserValue> {
        match self {
            AttributeValue::User(v) => Some(v.as_ref()),
            _ => None,
        }
    }

    /// Typed access to a user value.
    pub fn user_ref<T: UserValue>(&self) -> Option<&T> {
        self.as_user().and_then(|v| v.as_any().downcast_ref::<T>())
    }

    /// Column representation of a singular value.
    ///
    /// Views contribute their id; embeddables and plurals have none.
    pub fn column_value(&self) -> Option<Value> {
        match self {
            AttributeValue::Null => Some(Value::Null),
            AttributeValue::Basic(v) => Some(v.clone()),
            AttributeValue::User(v) => Some(v.to_value()),
            AttributeValue::View(v) if !v.view_type().is_embeddable() => {
                Some(v.id().cloned().unwrap_or(Value::Null))
            }
            _ => None,
        }
    }
}

impl From<Value> for AttributeValue {
    fn from(v: Value) -> Self {
        if v.is_null() {
            AttributeValue::Null
        } else {
            AttributeValue::Basic(v)
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Basic(Value::from(v))
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Basic(Value::from(v))
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Basic(Value::BigInt(v))
    }
}

impl From<i32> for AttributeValue {
    fn from(v: i32) -> Self {
        AttributeValue::Basic(Value::Int(v))
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Basic(Value::Bool(v))
    }
}

impl From<ViewInstance> for AttributeValue {
    fn from(v: ViewInstance) -> Self {
        AttributeValue::View(Box::new(v))
    }
}

impl From<Box<dyn UserValue>> for AttributeValue {
    fn from(v: Box<dyn UserValue>) -> Self {
        AttributeValue::User(v)
    }
}

impl From<PluralCollection> for AttributeValue {
    fn from(v: PluralCollection) -> Self {
        AttributeValue::Collection(v)
    }
}

impl From<PluralMap> for AttributeValue {
    fn from(v: PluralMap) -> Self {
        AttributeValue::Map(v)
    }
}

/// Identity comparison used for plural membership and replacement checks.
///
/// Views with ids compare by entity and id, id-less views structurally, user values
/// through their registered type (or their column representation when none
/// is registered), and basic values by value.
pub fn identity_eq(
    a: &AttributeValue,
    b: &AttributeValue,
    user_type: Option<&dyn BasicUserType>,
) -> bool {
    match (a, b) {
        (AttributeValue::Null, AttributeValue::Null) => true,
        (AttributeValue::Basic(x), AttributeValue::Basic(y)) => x.same_as(y),
        (AttributeValue::User(x), AttributeValue::User(y)) => match user_type {
            Some(ty) => ty.is_deep_equal(x.as_ref(), y.as_ref()),
            None => x.to_value().same_as(&y.to_value()),
        },
        (AttributeValue::View(x), AttributeValue::View(y)) => views_identical(x, y),
        (AttributeValue::Collection(x), AttributeValue::Collection(y)) => {
            x.kind() == y.kind()
                && x.len() == y.len()
                && match x.kind() {
                    CollectionKind::List => x
                        .iter()
                        .zip(y.iter())
                        .all(|(a, b)| identity_eq(a, b, user_type)),
                    CollectionKind::Set => x.iter().all(|a| y.contains_with(a, user_type)),
                }
        }
        (AttributeValue::Map(x), AttributeValue::Map(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| {
                    y.get_with(k, None)
                        .is_some_and(|other| identity_eq(v, other, user_type))
                })
        }
        _ => false,
    }
}

/// Views with ids are the same element when they denote the same entity row,
/// whichever view type projects it. Id-less views must share their type.
fn views_identical(x: &ViewInstance, y: &ViewInstance) -> bool {
    match (x.id(), y.id()) {
        (Some(a), Some(b)) => x.view_type().entity() == y.view_type().entity() && a.same_as(b),
        (None, None) if x.view_type().name() != y.view_type().name() => false,
        (None, None) => match (x.values(), y.values()) {
            (Some(xs), Some(ys)) => x
                .view_type()
                .attributes()
                .iter()
                .zip(xs.iter().zip(ys.iter()))
                .all(|(decl, (a, b))| identity_eq(a, b, decl.user_type().map(|t| t.as_ref()))),
            _ => false,
        },
        _ => false,
    }
}

/// The live value of a collection attribute.
///
/// Once the collection is held by a view, membership checks compare user
/// type elements through the attribute's registered element type, the same
/// way the change tracker does. A free-standing collection compares them by
/// their column value.
#[derive(Debug, Clone, Default)]
pub struct PluralCollection {
    kind: CollectionKind,
    elements: Vec<AttributeValue>,
    element_type: Option<Arc<dyn BasicUserType>>,
}

impl PluralCollection {
    /// Empty collection of the given kind.
    pub fn new(kind: CollectionKind) -> Self {
        Self {
            kind,
            elements: Vec::new(),
            element_type: None,
        }
    }

    /// Empty set.
    pub fn set() -> Self {
        Self::new(CollectionKind::Set)
    }

    /// Empty list.
    pub fn list() -> Self {
        Self::new(CollectionKind::List)
    }

    /// Collection built from elements; sets drop identity duplicates.
    pub fn from_elements<I, T>(kind: CollectionKind, elements: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<AttributeValue>,
    {
        let mut collection = Self::new(kind);
        for element in elements {
            collection.add(element);
        }
        collection
    }

    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AttributeValue> {
        self.elements.iter()
    }

    /// Mutable element access, used to mutate element views in place.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, AttributeValue> {
        self.elements.iter_mut()
    }

    pub fn get(&self, index: usize) -> Option<&AttributeValue> {
        self.elements.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut AttributeValue> {
        self.elements.get_mut(index)
    }

    /// Add an element. Returns false when a set already holds it.
    pub fn add(&mut self, element: impl Into<AttributeValue>) -> bool {
        let element = element.into();
        if self.kind == CollectionKind::Set && self.contains(&element) {
            return false;
        }
        self.elements.push(element);
        true
    }

    /// Remove the first element identical to `element`.
    pub fn remove(&mut self, element: &AttributeValue) -> bool {
        let element_type = self.element_type.as_deref();
        match self
            .elements
            .iter()
            .position(|e| identity_eq(e, element, element_type))
        {
            Some(index) => {
                self.elements.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove every element matching the predicate, returning how many.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&AttributeValue) -> bool) -> usize {
        let before = self.elements.len();
        self.elements.retain(|e| !predicate(e));
        before - self.elements.len()
    }

    pub fn clear(&mut self) {
        self.elements.clear();
    }

    pub fn contains(&self, element: &AttributeValue) -> bool {
        self.contains_with(element, self.element_type.as_deref())
    }

    /// Compare user type elements through `element_type` from now on. A set
    /// drops the elements that become duplicates under it.
    pub(crate) fn bind_element_type(&mut self, element_type: Option<&Arc<dyn BasicUserType>>) {
        self.element_type = element_type.cloned();
        if self.kind == CollectionKind::Set {
            let elements = std::mem::take(&mut self.elements);
            for element in elements {
                self.add(element);
            }
        }
    }

    pub(crate) fn contains_with(
        &self,
        element: &AttributeValue,
        user_type: Option<&dyn BasicUserType>,
    ) -> bool {
        self.elements
            .iter()
            .any(|e| identity_eq(e, element, user_type))
    }

    /// Element view with the given id.
    pub fn find_view_mut(&mut self, id: &Value) -> Option<&mut ViewInstance> {
        self.elements.iter_mut().find_map(|e| match e {
            AttributeValue::View(v) if v.id().is_some_and(|vid| vid.same_as(id)) => Some(&mut **v),
            _ => None,
        })
    }

    /// Whether two elements are identical to each other.
    pub(crate) fn has_duplicates(&self, user_type: Option<&dyn BasicUserType>) -> bool {
        self.elements.iter().enumerate().any(|(i, a)| {
            self.elements[i + 1..]
                .iter()
                .any(|b| identity_eq(a, b, user_type))
        })
    }

    pub(crate) fn map_elements(&self, f: impl Fn(&AttributeValue) -> AttributeValue) -> Self {
        Self {
            kind: self.kind,
            elements: self.elements.iter().map(f).collect(),
            element_type: self.element_type.clone(),
        }
    }
}

/// The live value of a map attribute, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct PluralMap {
    entries: Vec<(AttributeValue, AttributeValue)>,
}

impl PluralMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map built from entries; later keys replace earlier ones.
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<AttributeValue>,
        V: Into<AttributeValue>,
    {
        let mut map = Self::new();
        for (k, v) in entries {
            map.put(k, v);
        }
        map
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace, returning the previous element.
    pub fn put(
        &mut self,
        key: impl Into<AttributeValue>,
        element: impl Into<AttributeValue>,
    ) -> Option<AttributeValue> {
        let key = key.into();
        let element = element.into();
        match self.position(&key, None) {
            Some(index) => Some(std::mem::replace(&mut self.entries[index].1, element)),
            None => {
                self.entries.push((key, element));
                None
            }
        }
    }

    /// Remove a key, returning its element.
    pub fn remove(&mut self, key: &AttributeValue) -> Option<AttributeValue> {
        let index = self.position(key, None)?;
        Some(self.entries.remove(index).1)
    }

    pub fn get(&self, key: &AttributeValue) -> Option<&AttributeValue> {
        self.get_with(key, None)
    }

    pub fn get_mut(&mut self, key: &AttributeValue) -> Option<&mut AttributeValue> {
        let index = self.position(key, None)?;
        Some(&mut self.entries[index].1)
    }

    pub fn contains_key(&self, key: &AttributeValue) -> bool {
        self.position(key, None).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AttributeValue, &AttributeValue)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    /// Iterate with mutable elements.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&AttributeValue, &mut AttributeValue)> {
        self.entries.iter_mut().map(|(k, v)| (&*k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &AttributeValue> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &AttributeValue> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub(crate) fn get_with(
        &self,
        key: &AttributeValue,
        key_type: Option<&dyn BasicUserType>,
    ) -> Option<&AttributeValue> {
        self.position(key, key_type).map(|i| &self.entries[i].1)
    }

    pub(crate) fn entry_mut(&mut self, index: usize) -> Option<(&mut AttributeValue, &mut AttributeValue)> {
        self.entries.get_mut(index).map(|(k, v)| (k, v))
    }

    fn position(&self, key: &AttributeValue, key_type: Option<&dyn BasicUserType>) -> Option<usize> {
        self.entries
            .iter()
            .position(|(k, _)| identity_eq(k, key, key_type))
    }

    pub(crate) fn map_entries(
        &self,
        f: impl Fn(&AttributeValue, &AttributeValue) -> (AttributeValue, AttributeValue),
    ) -> Self {
        Self {
            entries: self.entries.iter().map(|(k, v)| f(k, v)).collect(),
        }
    }
}
