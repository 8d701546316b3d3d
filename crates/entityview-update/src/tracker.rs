//! Dirty state tracking.
//!
//! Every loaded [`ViewInstance`] owns a [`DirtyStateTracker`] holding, per
//! attribute, the snapshot taken when the instance was materialized (or last
//! flushed) plus two flags: `replaced` when the attribute was assigned a new
//! value, `touched` when the live value was handed out mutably. Change kinds
//! and plural partitions are computed on demand by comparing snapshots with
//! live values, so reading them never changes the tracker.

use crate::user_type::BasicUserType;
use crate::value::{AttributeValue, PluralCollection, PluralMap, identity_eq};
use crate::view::ViewInstance;
use crate::view_type::{AttributeDecl, AttributeKind, BasicType, CollectionKind};
use std::sync::Arc;

static NULL_VALUE: AttributeValue = AttributeValue::Null;

/// Shared NULL used where an attribute has no value to borrow.
pub(crate) fn null_value() -> &'static AttributeValue {
    &NULL_VALUE
}

/// How an attribute changed since its snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Unchanged.
    #[default]
    None,
    /// The whole value was replaced.
    Updated,
    /// The value's own nested state changed in place.
    Mutated,
}

/// A change kind plus whether it was established in memory.
///
/// `provable == false` means the change could only be assumed (an
/// unregistered mutable type was handed out mutably); the planner answers
/// that with reload-and-diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dirt {
    pub kind: ChangeKind,
    pub provable: bool,
}

impl Dirt {
    pub const CLEAN: Dirt = Dirt {
        kind: ChangeKind::None,
        provable: true,
    };

    pub const UPDATED: Dirt = Dirt {
        kind: ChangeKind::Updated,
        provable: true,
    };

    pub fn mutated(provable: bool) -> Self {
        Dirt {
            kind: ChangeKind::Mutated,
            provable,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.kind != ChangeKind::None
    }
}

/// Per-attribute mutation flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtyFlags {
    /// Assigned a new value.
    pub replaced: bool,
    /// Handed out mutably.
    pub touched: bool,
}

impl DirtyFlags {
    pub(crate) const REPLACED: DirtyFlags = DirtyFlags {
        replaced: true,
        touched: false,
    };
}

/// Snapshots and flags for one view instance.
#[derive(Debug, Clone, Default)]
pub struct DirtyStateTracker {
    initial: Vec<AttributeValue>,
    flags: Vec<DirtyFlags>,
}

impl DirtyStateTracker {
    /// Snapshot every attribute of a freshly materialized instance.
    pub(crate) fn new(decls: &[AttributeDecl], values: &[AttributeValue]) -> Self {
        let mut tracker = Self {
            initial: Vec::with_capacity(values.len()),
            flags: vec![DirtyFlags::default(); values.len()],
        };
        for (decl, value) in decls.iter().zip(values) {
            tracker.initial.push(snapshot_value(decl, value));
        }
        tracker
    }

    /// Snapshot of an attribute.
    pub fn initial(&self, index: usize) -> &AttributeValue {
        self.initial.get(index).unwrap_or(&NULL_VALUE)
    }

    /// Flags of an attribute.
    pub fn flags(&self, index: usize) -> DirtyFlags {
        self.flags.get(index).copied().unwrap_or_default()
    }

    /// Whether any attribute was replaced or handed out mutably.
    pub fn is_touched(&self) -> bool {
        self.flags.iter().any(|f| f.replaced || f.touched)
    }

    /// Take a new snapshot of one attribute and clear its flags.
    pub(crate) fn snapshot(&mut self, index: usize, decl: &AttributeDecl, value: &AttributeValue) {
        if let Some(slot) = self.initial.get_mut(index) {
            *slot = snapshot_value(decl, value);
        }
        if let Some(flags) = self.flags.get_mut(index) {
            *flags = DirtyFlags::default();
        }
    }

    pub(crate) fn mark_replaced(&mut self, index: usize) {
        if let Some(flags) = self.flags.get_mut(index) {
            flags.replaced = true;
        }
    }

    pub(crate) fn mark_touched(&mut self, index: usize) {
        if let Some(flags) = self.flags.get_mut(index) {
            flags.touched = true;
        }
    }
}

/// Copy a live value for use as a snapshot.
///
/// Registered user types are deep-cloned through their capability, other
/// user values through `clone_box`.
pub(crate) fn snapshot_value(decl: &AttributeDecl, value: &AttributeValue) -> AttributeValue {
    let value_type = decl.user_type();
    let key_type = decl.key_user_type();
    match value {
        AttributeValue::Collection(c) => {
            AttributeValue::Collection(c.map_elements(|e| snapshot_element(e, value_type)))
        }
        AttributeValue::Map(m) => AttributeValue::Map(m.map_entries(|k, v| {
            (snapshot_element(k, key_type), snapshot_element(v, value_type))
        })),
        other => snapshot_element(other, value_type),
    }
}

fn snapshot_element(
    value: &AttributeValue,
    user_type: Option<&Arc<dyn BasicUserType>>,
) -> AttributeValue {
    match (value, user_type) {
        (AttributeValue::User(v), Some(ty)) => AttributeValue::User(ty.deep_clone(v.as_ref())),
        _ => value.clone(),
    }
}

/// Dirtiness of a whole instance: MUTATED when any attribute changed.
pub fn view_dirt(view: &ViewInstance) -> Dirt {
    let (Some(values), Some(tracker)) = (view.values(), view.tracker()) else {
        return Dirt::CLEAN;
    };
    let mut dirty = false;
    let mut provable = true;
    for (index, decl) in view.view_type().attributes().iter().enumerate() {
        let dirt = attribute_dirt(
            decl,
            tracker.initial(index),
            &values[index],
            tracker.flags(index),
        );
        if dirt.is_dirty() {
            dirty = true;
            provable &= dirt.provable;
        }
    }
    if dirty { Dirt::mutated(provable) } else { Dirt::CLEAN }
}

/// Dirtiness of one attribute given its snapshot, live value and flags.
pub fn attribute_dirt(
    decl: &AttributeDecl,
    initial: &AttributeValue,
    current: &AttributeValue,
    flags: DirtyFlags,
) -> Dirt {
    match decl.kind() {
        AttributeKind::Basic(BasicType::Immutable) => {
            if identity_eq(initial, current, None) {
                Dirt::CLEAN
            } else {
                Dirt::UPDATED
            }
        }
        AttributeKind::Basic(BasicType::User(_)) => {
            user_dirt(decl.user_type().map(|t| t.as_ref()), initial, current, flags)
        }
        AttributeKind::Embeddable(_) | AttributeKind::ToOne(_) => {
            singular_view_dirt(initial, current, flags)
        }
        AttributeKind::Collection { kind, .. } => {
            let delta = collection_delta(
                *kind,
                initial.as_collection(),
                current.as_collection(),
                decl.user_type().map(|t| t.as_ref()),
            );
            plural_dirt(delta.summary(), decl.is_provable(), flags)
        }
        AttributeKind::Map { .. } => {
            let delta = map_delta(
                initial.as_map(),
                current.as_map(),
                decl.key_user_type().map(|t| t.as_ref()),
                decl.user_type().map(|t| t.as_ref()),
            );
            plural_dirt(delta.summary(), decl.is_provable(), flags)
        }
    }
}

/// Dirtiness of a plural element given the attribute's element type.
pub(crate) fn element_dirt(
    initial: Option<&AttributeValue>,
    current: Option<&AttributeValue>,
) -> Dirt {
    match (initial, current) {
        (Some(_), Some(current)) => match current.as_view() {
            Some(view) => view_dirt(view),
            None => Dirt::CLEAN,
        },
        (None, None) => Dirt::CLEAN,
        _ => Dirt::UPDATED,
    }
}

fn user_dirt(
    user_type: Option<&dyn BasicUserType>,
    initial: &AttributeValue,
    current: &AttributeValue,
    flags: DirtyFlags,
) -> Dirt {
    match (initial, current) {
        (AttributeValue::Null, AttributeValue::Null) => Dirt::CLEAN,
        (AttributeValue::Null, _) | (_, AttributeValue::Null) => Dirt::UPDATED,
        _ => match user_type {
            Some(ty) => {
                if identity_eq(initial, current, Some(ty)) {
                    Dirt::CLEAN
                } else if flags.replaced {
                    Dirt::UPDATED
                } else {
                    Dirt::mutated(true)
                }
            }
            None if flags.replaced => Dirt::UPDATED,
            None if flags.touched => Dirt::mutated(false),
            None => Dirt::CLEAN,
        },
    }
}

fn singular_view_dirt(initial: &AttributeValue, current: &AttributeValue, flags: DirtyFlags) -> Dirt {
    match (initial, current) {
        (AttributeValue::Null, AttributeValue::Null) => Dirt::CLEAN,
        (AttributeValue::Null, _) | (_, AttributeValue::Null) => Dirt::UPDATED,
        (_, AttributeValue::View(view)) => {
            if flags.replaced && !identity_eq(initial, current, None) {
                return Dirt::UPDATED;
            }
            let nested = view_dirt(view);
            if nested.is_dirty() {
                Dirt::mutated(nested.provable)
            } else {
                Dirt::CLEAN
            }
        }
        _ => Dirt::UPDATED,
    }
}

/// Shape of a plural delta, enough to classify it.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DeltaSummary {
    membership: bool,
    nested: bool,
    nested_provable: bool,
}

fn plural_dirt(summary: DeltaSummary, provable_elements: bool, flags: DirtyFlags) -> Dirt {
    let assumed = flags.touched && !provable_elements;
    if flags.replaced {
        // A replaced collection is rewritten whole, even with equal contents.
        Dirt {
            kind: ChangeKind::Updated,
            provable: !assumed,
        }
    } else if summary.membership {
        Dirt::mutated(!assumed)
    } else if summary.nested {
        Dirt::mutated(summary.nested_provable && !assumed)
    } else if assumed {
        Dirt::mutated(false)
    } else {
        Dirt::CLEAN
    }
}

/// Partition of a collection into added, removed and mutated elements.
///
/// Elements are matched by identity as a multiset: each live element
/// consumes at most one unmatched snapshot element, so an element present in
/// both is never reported as both added and removed.
#[derive(Debug, Clone, Default)]
pub struct CollectionDelta<'a> {
    /// Live elements without a snapshot counterpart.
    pub added: Vec<&'a AttributeValue>,
    /// Snapshot elements without a live counterpart.
    pub removed: Vec<&'a AttributeValue>,
    /// `(snapshot, live)` pairs whose live element view changed in place.
    pub mutated: Vec<(&'a AttributeValue, &'a AttributeValue)>,
    /// Every matched `(snapshot, live)` pair.
    pub retained: Vec<(&'a AttributeValue, &'a AttributeValue)>,
    /// A list kept its members but changed their order.
    pub reordered: bool,
}

impl CollectionDelta<'_> {
    /// Whether the membership (or list order) changed.
    pub fn has_membership_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty() || self.reordered
    }

    pub(crate) fn summary(&self) -> DeltaSummary {
        DeltaSummary {
            membership: self.has_membership_changes(),
            nested: !self.mutated.is_empty(),
            nested_provable: self
                .mutated
                .iter()
                .all(|(_, current)| element_dirt(Some(current), Some(current)).provable),
        }
    }
}

/// Partition a collection's snapshot against its live value.
pub fn collection_delta<'a>(
    kind: CollectionKind,
    initial: Option<&'a PluralCollection>,
    current: Option<&'a PluralCollection>,
    user_type: Option<&dyn BasicUserType>,
) -> CollectionDelta<'a> {
    let snapshot: Vec<&AttributeValue> = initial.map(|c| c.iter().collect()).unwrap_or_default();
    let mut matched = vec![false; snapshot.len()];
    let mut order = Vec::new();
    let mut delta = CollectionDelta::default();

    for element in current.into_iter().flat_map(PluralCollection::iter) {
        let found = snapshot
            .iter()
            .enumerate()
            .position(|(i, old)| !matched[i] && identity_eq(old, element, user_type));
        match found {
            Some(i) => {
                matched[i] = true;
                order.push(i);
                delta.retained.push((snapshot[i], element));
                if element_dirt(Some(snapshot[i]), Some(element)).is_dirty() {
                    delta.mutated.push((snapshot[i], element));
                }
            }
            None => delta.added.push(element),
        }
    }

    delta.removed = snapshot
        .iter()
        .zip(matched.iter())
        .filter(|(_, m)| !**m)
        .map(|(e, _)| *e)
        .collect();
    delta.reordered = kind == CollectionKind::List && order.windows(2).any(|w| w[0] > w[1]);
    delta
}

/// One map entry seen in both the snapshot and the live map.
#[derive(Debug, Clone, Copy)]
pub struct MapEntryChange<'a> {
    /// Live key.
    pub key: &'a AttributeValue,
    /// Snapshot element.
    pub initial: &'a AttributeValue,
    /// Live element.
    pub current: &'a AttributeValue,
}

/// Partition of a map into key and element changes.
#[derive(Debug, Clone, Default)]
pub struct MapDelta<'a> {
    /// Entries whose key is new.
    pub added: Vec<(&'a AttributeValue, &'a AttributeValue)>,
    /// Entries whose key disappeared.
    pub removed: Vec<(&'a AttributeValue, &'a AttributeValue)>,
    /// Entries whose key survived but whose element was replaced.
    pub replaced: Vec<MapEntryChange<'a>>,
    /// `(snapshot, live)` keys whose key view changed in place.
    pub mutated_keys: Vec<(&'a AttributeValue, &'a AttributeValue)>,
    /// Entries whose element view changed in place.
    pub mutated_elements: Vec<MapEntryChange<'a>>,
    /// Every entry whose key survived.
    pub retained: Vec<MapEntryChange<'a>>,
}

impl MapDelta<'_> {
    /// Whether keys or elements were added, removed or replaced.
    pub fn has_membership_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty() || !self.replaced.is_empty()
    }

    pub(crate) fn summary(&self) -> DeltaSummary {
        let keys_provable = self
            .mutated_keys
            .iter()
            .all(|(_, k)| element_dirt(Some(k), Some(k)).provable);
        let elements_provable = self
            .mutated_elements
            .iter()
            .all(|c| element_dirt(Some(c.current), Some(c.current)).provable);
        DeltaSummary {
            membership: self.has_membership_changes(),
            nested: !self.mutated_keys.is_empty() || !self.mutated_elements.is_empty(),
            nested_provable: keys_provable && elements_provable,
        }
    }
}

/// Partition a map's snapshot against its live value.
pub fn map_delta<'a>(
    initial: Option<&'a PluralMap>,
    current: Option<&'a PluralMap>,
    key_type: Option<&dyn BasicUserType>,
    element_type: Option<&dyn BasicUserType>,
) -> MapDelta<'a> {
    let snapshot: Vec<(&AttributeValue, &AttributeValue)> =
        initial.map(|m| m.iter().collect()).unwrap_or_default();
    let mut matched = vec![false; snapshot.len()];
    let mut delta = MapDelta::default();

    for (key, element) in current.into_iter().flat_map(PluralMap::iter) {
        let found = snapshot
            .iter()
            .enumerate()
            .position(|(i, (old, _))| !matched[i] && identity_eq(old, key, key_type));
        let Some(i) = found else {
            delta.added.push((key, element));
            continue;
        };
        matched[i] = true;
        let (old_key, old_element) = snapshot[i];
        if element_dirt(Some(old_key), Some(key)).is_dirty() {
            delta.mutated_keys.push((old_key, key));
        }
        let change = MapEntryChange {
            key,
            initial: old_element,
            current: element,
        };
        if !identity_eq(old_element, element, element_type) {
            delta.replaced.push(change);
        } else if element_dirt(Some(old_element), Some(element)).is_dirty() {
            delta.mutated_elements.push(change);
        }
        delta.retained.push(change);
    }

    delta.removed = snapshot
        .iter()
        .zip(matched.iter())
        .filter(|(_, m)| !**m)
        .map(|(entry, _)| *entry)
        .collect();
    delta
}
