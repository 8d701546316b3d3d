//! Live view instances.
//!
//! A [`ViewInstance`] is either a *reference* (the id of an unfetched view)
//! or *loaded*, in which case it owns the current attribute values and the
//! [`DirtyStateTracker`] snapshotted when it was built. Attributes are
//! addressed by dotted paths that walk through nested embeddable and to-one
//! views. Mutation goes through the mutators here so the tracker can tell a
//! replaced value from one changed in place.

use crate::tracker::{ChangeKind, DirtyStateTracker, attribute_dirt, null_value, view_dirt};
use crate::user_type::UserValue;
use crate::value::{AttributeValue, PluralCollection, PluralMap};
use crate::view_type::{AttributeDecl, AttributeKind, BasicType, CollectionKind, ViewType};
use entityview_core::{Error, Result, Value};
use std::sync::Arc;

/// A live projection of one entity (or one embeddable value).
#[derive(Debug, Clone)]
pub struct ViewInstance {
    view_type: Arc<ViewType>,
    id: AttributeValue,
    version: AttributeValue,
    state: ViewState,
    new: bool,
}

#[derive(Debug, Clone)]
enum ViewState {
    Reference,
    Loaded {
        values: Vec<AttributeValue>,
        tracker: DirtyStateTracker,
    },
}

impl ViewInstance {
    /// An unfetched view holding only its id.
    pub fn reference(view_type: Arc<ViewType>, id: impl Into<Value>) -> Self {
        Self {
            view_type,
            id: AttributeValue::from(id.into()),
            version: AttributeValue::Null,
            state: ViewState::Reference,
            new: false,
        }
    }

    /// A new instance of a creatable view type, not yet persisted.
    ///
    /// Every attribute starts null (plural ones empty) and accepts values
    /// regardless of updatability. The next flush inserts the entity row.
    pub fn create(view_type: Arc<ViewType>, id: impl Into<Value>) -> Result<Self> {
        if !view_type.is_creatable() {
            return Err(Error::not_creatable(view_type.name()));
        }
        let mut view = Self::builder(view_type).id(id).build()?;
        view.new = true;
        Ok(view)
    }

    /// Start materializing a loaded view.
    pub fn builder(view_type: Arc<ViewType>) -> ViewInstanceBuilder {
        ViewInstanceBuilder {
            view_type,
            id: None,
            version: None,
            values: Vec::new(),
        }
    }

    /// A loaded view whose values are in declaration order. The tracker
    /// snapshots them immediately.
    pub(crate) fn loaded(
        view_type: Arc<ViewType>,
        id: Option<Value>,
        version: Option<i64>,
        mut values: Vec<AttributeValue>,
    ) -> Self {
        for (decl, value) in view_type.attributes().iter().zip(values.iter_mut()) {
            bind_element_type(decl, value);
        }
        let tracker = DirtyStateTracker::new(view_type.attributes(), &values);
        Self {
            view_type,
            id: id.map_or(AttributeValue::Null, AttributeValue::from),
            version: version.map_or(AttributeValue::Null, AttributeValue::from),
            state: ViewState::Loaded { values, tracker },
            new: false,
        }
    }

    pub fn view_type(&self) -> &Arc<ViewType> {
        &self.view_type
    }

    /// Identifier, absent for embeddable views.
    pub fn id(&self) -> Option<&Value> {
        self.id.as_basic()
    }

    /// Version token the view was loaded (or last flushed) with.
    pub fn version(&self) -> Option<i64> {
        self.version.as_basic().and_then(Value::as_i64)
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.state, ViewState::Reference)
    }

    pub fn is_loaded(&self) -> bool {
        !self.is_reference()
    }

    /// Whether the view was created and its entity row not yet inserted.
    pub fn is_new(&self) -> bool {
        self.new
    }

    /// Current values in declaration order, `None` for references.
    pub fn values(&self) -> Option<&[AttributeValue]> {
        match &self.state {
            ViewState::Loaded { values, .. } => Some(values),
            ViewState::Reference => None,
        }
    }

    /// Dirty state tracker, `None` for references.
    pub fn tracker(&self) -> Option<&DirtyStateTracker> {
        match &self.state {
            ViewState::Loaded { tracker, .. } => Some(tracker),
            ViewState::Reference => None,
        }
    }

    /// Current value at a dotted path. A null intermediate view yields null.
    pub fn get(&self, path: &str) -> Result<&AttributeValue> {
        let (head, rest) = split_path(path);
        if rest.is_none() {
            if self.is_id_name(head) {
                return Ok(&self.id);
            }
            if self.is_version_name(head) {
                return Ok(&self.version);
            }
        }
        let index = self
            .view_type
            .index_of(head)
            .ok_or_else(|| Error::unknown_attribute(self.view_type.name(), path))?;
        let values = self
            .values()
            .ok_or_else(|| Error::not_loaded(self.view_type.name()))?;
        match (rest, &values[index]) {
            (None, value) => Ok(value),
            (Some(rest), AttributeValue::View(view)) => view.get(rest),
            (Some(_), AttributeValue::Null) => Ok(null_value()),
            (Some(_), _) => Err(Error::kind_mismatch(head, "a view")),
        }
    }

    /// Whether any attribute changed since the last snapshot.
    pub fn is_dirty(&self) -> bool {
        view_dirt(self).is_dirty()
    }

    /// Change kind of the attribute at a dotted path.
    pub fn kind(&self, path: &str) -> Result<ChangeKind> {
        let (owner, index) = self.locate(path)?;
        let decl = &owner.view_type.attributes()[index];
        match (owner.values(), owner.tracker()) {
            (Some(values), Some(tracker)) => Ok(attribute_dirt(
                decl,
                tracker.initial(index),
                &values[index],
                tracker.flags(index),
            )
            .kind),
            _ => Err(Error::not_loaded(owner.view_type.name())),
        }
    }

    /// Whether the attribute at a dotted path changed.
    pub fn is_dirty_path(&self, path: &str) -> Result<bool> {
        Ok(self.kind(path)? != ChangeKind::None)
    }

    /// Replace the value at a dotted path.
    pub fn set(&mut self, path: &str, value: impl Into<AttributeValue>) -> Result<()> {
        let mut value = value.into();
        let (owner, index) = self.locate_mut(path)?;
        let view_type = Arc::clone(&owner.view_type);
        let decl = &view_type.attributes()[index];
        ensure_updatable(owner.new, &view_type, decl, path)?;
        check_value(decl, &value, path)?;
        bind_element_type(decl, &mut value);
        let (values, tracker) = owner
            .parts_mut()
            .ok_or_else(|| Error::not_loaded(view_type.name()))?;
        values[index] = value;
        tracker.mark_replaced(index);
        Ok(())
    }

    /// Live collection at a dotted path, for in-place add/remove.
    pub fn collection_mut(&mut self, path: &str) -> Result<&mut PluralCollection> {
        let (owner, index) = self.locate_mut(path)?;
        let view_type = Arc::clone(&owner.view_type);
        ensure_updatable(owner.new, &view_type, &view_type.attributes()[index], path)?;
        let (values, tracker) = owner
            .parts_mut()
            .ok_or_else(|| Error::not_loaded(view_type.name()))?;
        match &mut values[index] {
            AttributeValue::Collection(collection) => {
                tracker.mark_touched(index);
                Ok(collection)
            }
            _ => Err(Error::kind_mismatch(path, "a collection")),
        }
    }

    /// Live map at a dotted path, for in-place put/remove.
    pub fn map_mut(&mut self, path: &str) -> Result<&mut PluralMap> {
        let (owner, index) = self.locate_mut(path)?;
        let view_type = Arc::clone(&owner.view_type);
        ensure_updatable(owner.new, &view_type, &view_type.attributes()[index], path)?;
        let (values, tracker) = owner
            .parts_mut()
            .ok_or_else(|| Error::not_loaded(view_type.name()))?;
        match &mut values[index] {
            AttributeValue::Map(map) => {
                tracker.mark_touched(index);
                Ok(map)
            }
            _ => Err(Error::kind_mismatch(path, "a map")),
        }
    }

    /// Nested embeddable or to-one view at a dotted path, for in-place
    /// mutation. To-one targets stay mutable even when the association
    /// itself is read-only.
    pub fn view_mut(&mut self, path: &str) -> Result<&mut ViewInstance> {
        let (owner, index) = self.locate_mut(path)?;
        let view_type = Arc::clone(&owner.view_type);
        let decl = &view_type.attributes()[index];
        if matches!(decl.kind(), AttributeKind::Embeddable(_)) {
            ensure_updatable(owner.new, &view_type, decl, path)?;
        }
        let (values, tracker) = owner
            .parts_mut()
            .ok_or_else(|| Error::not_loaded(view_type.name()))?;
        match &mut values[index] {
            AttributeValue::View(view) => {
                tracker.mark_touched(index);
                Ok(&mut **view)
            }
            _ => Err(Error::kind_mismatch(path, "a view")),
        }
    }

    /// Typed user value at a dotted path, for in-place mutation.
    pub fn user_value_mut<T: UserValue>(&mut self, path: &str) -> Result<&mut T> {
        let (owner, index) = self.locate_mut(path)?;
        let view_type = Arc::clone(&owner.view_type);
        ensure_updatable(owner.new, &view_type, &view_type.attributes()[index], path)?;
        let (values, tracker) = owner
            .parts_mut()
            .ok_or_else(|| Error::not_loaded(view_type.name()))?;
        match &mut values[index] {
            AttributeValue::User(value) => {
                tracker.mark_touched(index);
                value
                    .as_any_mut()
                    .downcast_mut::<T>()
                    .ok_or_else(|| Error::kind_mismatch(path, std::any::type_name::<T>()))
            }
            _ => Err(Error::kind_mismatch(path, "a user value")),
        }
    }

    /// Take fresh snapshots of every attribute, recursively, and clear all
    /// mutation flags.
    pub(crate) fn reset_tracking(&mut self) {
        let ViewState::Loaded { values, tracker } = &mut self.state else {
            return;
        };
        for (index, decl) in self.view_type.attributes().iter().enumerate() {
            reset_nested(&mut values[index]);
            tracker.snapshot(index, decl, &values[index]);
        }
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.new = false;
    }

    pub(crate) fn set_version(&mut self, version: i64) {
        self.version = AttributeValue::from(version);
    }

    /// Live value of a direct attribute, without marking it touched.
    pub(crate) fn value_untracked_mut(&mut self, name: &str) -> Option<&mut AttributeValue> {
        let index = self.view_type.index_of(name)?;
        self.parts_mut().map(|(values, _)| &mut values[index])
    }

    /// Owner view and attribute index of a dotted path.
    pub(crate) fn locate(&self, path: &str) -> Result<(&ViewInstance, usize)> {
        let (head, rest) = split_path(path);
        let index = self
            .view_type
            .index_of(head)
            .ok_or_else(|| Error::unknown_attribute(self.view_type.name(), path))?;
        let Some(rest) = rest else {
            return Ok((self, index));
        };
        let values = self
            .values()
            .ok_or_else(|| Error::not_loaded(self.view_type.name()))?;
        match &values[index] {
            AttributeValue::View(view) => view.locate(rest),
            _ => Err(Error::kind_mismatch(head, "a view")),
        }
    }

    fn locate_mut(&mut self, path: &str) -> Result<(&mut ViewInstance, usize)> {
        let mut current = self;
        let mut segments = path.split('.');
        let mut segment = segments.next().unwrap_or(path);
        loop {
            let index = current.mutable_index(segment, path)?;
            let Some(next) = segments.next() else {
                return Ok((current, index));
            };
            let decl = &current.view_type.attributes()[index];
            if matches!(decl.kind(), AttributeKind::Embeddable(_)) && !decl.is_updatable() && !current.new {
                return Err(Error::read_only(current.view_type.name(), path));
            }
            let name = segment;
            current = match current.parts_mut() {
                Some((values, _)) => match &mut values[index] {
                    AttributeValue::View(view) => &mut **view,
                    _ => return Err(Error::kind_mismatch(name, "a view")),
                },
                None => return Err(Error::kind_mismatch(name, "a loaded view")),
            };
            segment = next;
        }
    }

    fn mutable_index(&self, segment: &str, path: &str) -> Result<usize> {
        if self.is_reference() {
            return Err(Error::not_loaded(self.view_type.name()));
        }
        if self.is_id_name(segment) || self.is_version_name(segment) {
            return Err(Error::read_only(self.view_type.name(), path));
        }
        self.view_type
            .index_of(segment)
            .ok_or_else(|| Error::unknown_attribute(self.view_type.name(), path))
    }

    fn parts_mut(&mut self) -> Option<(&mut Vec<AttributeValue>, &mut DirtyStateTracker)> {
        match &mut self.state {
            ViewState::Loaded { values, tracker } => Some((values, tracker)),
            ViewState::Reference => None,
        }
    }

    fn is_id_name(&self, name: &str) -> bool {
        self.view_type.id().is_some_and(|d| d.name == name)
    }

    fn is_version_name(&self, name: &str) -> bool {
        self.view_type.version().is_some_and(|d| d.name == name)
    }
}

fn reset_nested(value: &mut AttributeValue) {
    match value {
        AttributeValue::View(view) => view.reset_tracking(),
        AttributeValue::Collection(collection) => {
            for element in collection.iter_mut() {
                reset_nested(element);
            }
        }
        AttributeValue::Map(map) => {
            for index in 0..map.len() {
                if let Some((key, element)) = map.entry_mut(index) {
                    reset_nested(key);
                    reset_nested(element);
                }
            }
        }
        _ => {}
    }
}

pub(crate) fn split_path(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    }
}

fn ensure_updatable(
    new: bool,
    view_type: &ViewType,
    decl: &AttributeDecl,
    path: &str,
) -> Result<()> {
    if new || (view_type.is_updatable() && decl.is_updatable()) {
        Ok(())
    } else {
        Err(Error::read_only(view_type.name(), path))
    }
}

fn bind_element_type(decl: &AttributeDecl, value: &mut AttributeValue) {
    if let AttributeValue::Collection(collection) = value {
        collection.bind_element_type(decl.user_type());
    }
}

fn check_value(decl: &AttributeDecl, value: &AttributeValue, path: &str) -> Result<()> {
    let matches = match (decl.kind(), value) {
        (kind, AttributeValue::Null) => !kind.is_plural(),
        (AttributeKind::Basic(BasicType::Immutable), AttributeValue::Basic(_))
        | (AttributeKind::Basic(BasicType::User(_)), AttributeValue::User(_))
        | (AttributeKind::Map { .. }, AttributeValue::Map(_)) => true,
        (AttributeKind::Embeddable(name) | AttributeKind::ToOne(name), AttributeValue::View(v)) => {
            v.view_type().name() == name
        }
        (AttributeKind::Collection { kind, .. }, AttributeValue::Collection(c)) => c.kind() == *kind,
        _ => false,
    };
    if matches {
        Ok(())
    } else {
        Err(Error::kind_mismatch(path, &expected_label(decl.kind())))
    }
}

fn expected_label(kind: &AttributeKind) -> String {
    match kind {
        AttributeKind::Basic(BasicType::Immutable) => "a basic value".to_string(),
        AttributeKind::Basic(BasicType::User(name)) => format!("a '{name}' user value"),
        AttributeKind::Embeddable(name) | AttributeKind::ToOne(name) => {
            format!("a '{name}' view")
        }
        AttributeKind::Collection {
            kind: CollectionKind::Set,
            ..
        } => "a set".to_string(),
        AttributeKind::Collection {
            kind: CollectionKind::List,
            ..
        } => "a list".to_string(),
        AttributeKind::Map { .. } => "a map".to_string(),
    }
}

/// Builder for loaded [`ViewInstance`]s.
#[derive(Debug)]
pub struct ViewInstanceBuilder {
    view_type: Arc<ViewType>,
    id: Option<Value>,
    version: Option<i64>,
    values: Vec<(String, AttributeValue)>,
}

impl ViewInstanceBuilder {
    pub fn id(mut self, id: impl Into<Value>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    /// Initial value of an attribute.
    pub fn value(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.values.push((name.into(), value.into()));
        self
    }

    /// Finish and snapshot. Plural attributes left unset start empty,
    /// singular ones null.
    pub fn build(self) -> Result<ViewInstance> {
        let view_type = self.view_type;
        match (view_type.id().is_some(), self.id.is_some()) {
            (true, false) => return Err(Error::missing_id(view_type.name())),
            (false, true) => {
                return Err(Error::invalid_declaration(format!(
                    "embeddable view '{}' cannot carry an id",
                    view_type.name()
                )));
            }
            _ => {}
        }

        let mut values: Vec<AttributeValue> = view_type
            .attributes()
            .iter()
            .map(|decl| match decl.kind() {
                AttributeKind::Collection { kind, .. } => {
                    AttributeValue::Collection(PluralCollection::new(*kind))
                }
                AttributeKind::Map { .. } => AttributeValue::Map(PluralMap::new()),
                _ => AttributeValue::Null,
            })
            .collect();
        for (name, value) in self.values {
            let (index, decl) = view_type
                .attribute(&name)
                .ok_or_else(|| Error::unknown_attribute(view_type.name(), &name))?;
            check_value(decl, &value, &name)?;
            values[index] = value;
        }

        let version = match view_type.version() {
            Some(_) => Some(self.version.unwrap_or(0)),
            None => None,
        };
        Ok(ViewInstance::loaded(view_type, self.id, version, values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user_type::tests::Counter;
    use crate::view_type::ElementType;
    use entityview_core::ViewErrorKind;

    fn address_type() -> Arc<ViewType> {
        Arc::new(
            ViewType::builder("AddressView")
                .basic("street")
                .basic("city")
                .build(),
        )
    }

    fn doc_type() -> Arc<ViewType> {
        Arc::new(
            ViewType::builder("DocView")
                .entity("Document")
                .id("id")
                .version("version")
                .basic("name")
                .attribute(AttributeDecl::basic("created").read_only())
                .embeddable("address", "AddressView")
                .user("counter", "counter")
                .set("tags", ElementType::basic())
                .build(),
        )
    }

    fn doc() -> ViewInstance {
        let address = ViewInstance::builder(address_type())
            .value("street", "Main")
            .value("city", "Vienna")
            .build()
            .unwrap();
        ViewInstance::builder(doc_type())
            .id(1_i64)
            .version(3)
            .value("name", "doc")
            .value("address", address)
            .value("counter", Box::new(Counter { hits: vec![1] }) as Box<dyn UserValue>)
            .value(
                "tags",
                PluralCollection::from_elements(CollectionKind::Set, ["a", "b"]),
            )
            .build()
            .unwrap()
    }

    fn view_error_kind(err: &Error) -> Option<ViewErrorKind> {
        match err {
            Error::View(e) => Some(e.kind),
            _ => None,
        }
    }

    #[test]
    fn test_builder_defaults_and_snapshot() {
        let view = ViewInstance::builder(doc_type()).id(7_i64).build().unwrap();
        assert_eq!(view.version(), Some(0));
        assert!(view.get("name").unwrap().is_null());
        assert!(view.get("tags").unwrap().as_collection().unwrap().is_empty());
        assert!(!view.is_dirty());
        assert_eq!(view.get("id").unwrap().as_basic(), Some(&Value::BigInt(7)));
    }

    #[test]
    fn test_builder_requires_id_for_entity_views() {
        let err = ViewInstance::builder(doc_type()).build().unwrap_err();
        assert_eq!(view_error_kind(&err), Some(ViewErrorKind::MissingId));

        let err = ViewInstance::builder(doc_type())
            .id(1_i64)
            .value("nope", "x")
            .build()
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_set_marks_updated() {
        let mut view = doc();
        view.set("name", "renamed").unwrap();
        assert_eq!(view.kind("name").unwrap(), ChangeKind::Updated);
        assert!(view.is_dirty());

        view.set("name", "doc").unwrap();
        assert_eq!(view.kind("name").unwrap(), ChangeKind::None);
    }

    #[test]
    fn test_in_place_embeddable_mutation_is_mutated() {
        let mut view = doc();
        view.set("address.city", "Graz").unwrap();
        assert_eq!(view.kind("address").unwrap(), ChangeKind::Mutated);
        assert_eq!(view.kind("address.city").unwrap(), ChangeKind::Updated);
        assert_eq!(view.kind("address.street").unwrap(), ChangeKind::None);
    }

    #[test]
    fn test_replacing_embeddable_is_updated() {
        let mut view = doc();
        let replacement = ViewInstance::builder(address_type())
            .value("street", "Ring")
            .value("city", "Vienna")
            .build()
            .unwrap();
        view.set("address", replacement).unwrap();
        assert_eq!(view.kind("address").unwrap(), ChangeKind::Updated);
    }

    #[test]
    fn test_identity_and_read_only_attributes_reject_mutation() {
        let mut view = doc();
        let err = view.set("id", 5_i64).unwrap_err();
        assert_eq!(view_error_kind(&err), Some(ViewErrorKind::ReadOnly));
        let err = view.set("version", 5_i64).unwrap_err();
        assert_eq!(view_error_kind(&err), Some(ViewErrorKind::ReadOnly));
        let err = view.set("created", "now").unwrap_err();
        assert_eq!(view_error_kind(&err), Some(ViewErrorKind::ReadOnly));
        assert!(view.set("missing", "x").unwrap_err().is_config_error());
    }

    #[test]
    fn test_reference_cannot_be_mutated() {
        let mut reference = ViewInstance::reference(doc_type(), 9_i64);
        assert!(reference.is_reference());
        assert_eq!(reference.id(), Some(&Value::BigInt(9)));
        let err = reference.set("name", "x").unwrap_err();
        assert_eq!(view_error_kind(&err), Some(ViewErrorKind::NotLoaded));
        assert!(!reference.is_dirty());
    }

    #[test]
    fn test_kind_mismatch_on_wrong_accessor() {
        let mut view = doc();
        let err = view.collection_mut("name").unwrap_err();
        assert_eq!(view_error_kind(&err), Some(ViewErrorKind::KindMismatch));
        let err = view.set("tags", "x").unwrap_err();
        assert_eq!(view_error_kind(&err), Some(ViewErrorKind::KindMismatch));
    }

    #[test]
    fn test_user_value_mut_and_reset() {
        let mut view = doc();
        view.user_value_mut::<Counter>("counter").unwrap().hits.push(2);
        assert_eq!(view.kind("counter").unwrap(), ChangeKind::Mutated);
        view.collection_mut("tags").unwrap().add("c");
        assert_eq!(view.kind("tags").unwrap(), ChangeKind::Mutated);

        view.reset_tracking();
        assert!(!view.is_dirty());
        assert_eq!(
            view.get("counter").unwrap().user_ref::<Counter>().unwrap().hits,
            vec![1, 2]
        );
    }

    #[test]
    fn test_create_needs_a_creatable_type() {
        let err = ViewInstance::create(doc_type(), 5_i64).unwrap_err();
        assert_eq!(view_error_kind(&err), Some(ViewErrorKind::NotCreatable));

        let creatable = Arc::new(
            ViewType::builder("DocView")
                .entity("Document")
                .id("id")
                .version("version")
                .basic("name")
                .attribute(AttributeDecl::basic("created").read_only())
                .creatable()
                .build(),
        );
        let mut view = ViewInstance::create(creatable, 5_i64).unwrap();
        assert!(view.is_new());
        assert_eq!(view.version(), Some(0));
        assert!(view.get("name").unwrap().is_null());
        view.set("created", "now").unwrap();
        assert!(view.is_dirty());

        view.mark_persisted();
        let err = view.set("created", "later").unwrap_err();
        assert_eq!(view_error_kind(&err), Some(ViewErrorKind::ReadOnly));
    }

    #[test]
    fn test_null_intermediate_reads_as_null() {
        let mut view = doc();
        view.set("address", AttributeValue::Null).unwrap();
        assert!(view.get("address.city").unwrap().is_null());
        assert_eq!(view.kind("address").unwrap(), ChangeKind::Updated);
    }
}
