//! Change models: a read-only tree over a view's dirty state.
//!
//! Models borrow from the view instance and compute everything on demand,
//! so building or walking them never touches the tracker. A model is one of
//! three variants: [`SingularChangeModel`] for the root and for basic,
//! embeddable and to-one attributes, [`PluralChangeModel`] for collections
//! and [`MapChangeModel`] for maps.

use crate::tracker::{
    ChangeKind, CollectionDelta, DirtyFlags, MapDelta, attribute_dirt, collection_delta,
    map_delta, null_value, view_dirt,
};
use crate::path::join;
use crate::value::{AttributeValue, identity_eq};
use crate::view::{ViewInstance, split_path};
use crate::view_type::{AttributeDecl, AttributeKind};
use entityview_core::{Error, Result};

/// Change model of the root of a view instance.
pub fn change_model(view: &ViewInstance) -> SingularChangeModel<'_> {
    SingularChangeModel {
        path: String::new(),
        subject: Subject::Root(view),
    }
}

/// A node of the change model tree.
#[derive(Debug)]
pub enum ChangeModel<'a> {
    Singular(SingularChangeModel<'a>),
    Plural(PluralChangeModel<'a>),
    Map(MapChangeModel<'a>),
}

impl<'a> ChangeModel<'a> {
    fn attribute(
        path: String,
        decl: &'a AttributeDecl,
        initial: &'a AttributeValue,
        current: &'a AttributeValue,
        flags: DirtyFlags,
    ) -> Self {
        match decl.kind() {
            AttributeKind::Collection { .. } => {
                ChangeModel::Plural(PluralChangeModel::new(path, decl, initial, current, flags))
            }
            AttributeKind::Map { .. } => {
                ChangeModel::Map(MapChangeModel::new(path, decl, initial, current, flags))
            }
            _ => ChangeModel::Singular(SingularChangeModel {
                path,
                subject: Subject::Attribute {
                    decl: Some(decl),
                    initial,
                    current,
                    flags,
                },
            }),
        }
    }

    fn element(path: &str, initial: &'a AttributeValue, current: &'a AttributeValue) -> Self {
        ChangeModel::Singular(SingularChangeModel {
            path: path.to_string(),
            subject: Subject::Attribute {
                decl: None,
                initial,
                current,
                flags: DirtyFlags::default(),
            },
        })
    }

    /// Path from the root view, empty for the root.
    pub fn path(&self) -> &str {
        match self {
            ChangeModel::Singular(m) => &m.path,
            ChangeModel::Plural(m) => &m.path,
            ChangeModel::Map(m) => &m.path,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeModel::Singular(m) => m.kind(),
            ChangeModel::Plural(m) => m.kind(),
            ChangeModel::Map(m) => m.kind(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.kind() != ChangeKind::None
    }

    /// Snapshot value; `None` for plural models and the root.
    pub fn initial_state(&self) -> Option<&'a AttributeValue> {
        match self {
            ChangeModel::Singular(m) => m.initial_state(),
            _ => None,
        }
    }

    /// Live value; `None` for plural models and the root.
    pub fn current_state(&self) -> Option<&'a AttributeValue> {
        match self {
            ChangeModel::Singular(m) => m.current_state(),
            _ => None,
        }
    }

    /// Directly dirty children: attributes for singular models, element
    /// (and key) changes for plural ones.
    pub fn dirty_changes(&self) -> Vec<ChangeModel<'a>> {
        match self {
            ChangeModel::Singular(m) => m.dirty_changes(),
            ChangeModel::Plural(m) => m.dirty_changes(),
            ChangeModel::Map(m) => m.dirty_changes(),
        }
    }

    /// Models at a path, fanning out over plural elements.
    pub fn get_all(&self, path: &str) -> Result<Vec<ChangeModel<'a>>> {
        match self {
            ChangeModel::Singular(m) => m.get_all(path),
            ChangeModel::Plural(m) => m.get_all(path),
            ChangeModel::Map(m) => m.get_all(path),
        }
    }

    pub fn as_singular(&self) -> Option<&SingularChangeModel<'a>> {
        match self {
            ChangeModel::Singular(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_plural(&self) -> Option<&PluralChangeModel<'a>> {
        match self {
            ChangeModel::Plural(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapChangeModel<'a>> {
        match self {
            ChangeModel::Map(m) => Some(m),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Subject<'a> {
    Root(&'a ViewInstance),
    Attribute {
        decl: Option<&'a AttributeDecl>,
        initial: &'a AttributeValue,
        current: &'a AttributeValue,
        flags: DirtyFlags,
    },
}

/// Where the children of a singular model come from.
enum Container<'a> {
    /// A view compared against its own tracker.
    Tracked(&'a ViewInstance),
    /// A replaced view: children compare old against new pairwise.
    Pair(Option<&'a ViewInstance>, Option<&'a ViewInstance>),
    /// No nested attributes.
    Leaf,
}

/// Change model of the root or of a singular attribute.
#[derive(Debug, Clone)]
pub struct SingularChangeModel<'a> {
    path: String,
    subject: Subject<'a>,
}

impl<'a> SingularChangeModel<'a> {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> ChangeKind {
        match self.subject {
            Subject::Root(view) => view_dirt(view).kind,
            Subject::Attribute {
                decl: Some(decl),
                initial,
                current,
                flags,
            } => attribute_dirt(decl, initial, current, flags).kind,
            Subject::Attribute {
                decl: None,
                initial,
                current,
                ..
            } => {
                if !identity_eq(initial, current, None) {
                    ChangeKind::Updated
                } else if current.as_view().is_some_and(|v| view_dirt(v).is_dirty()) {
                    ChangeKind::Mutated
                } else {
                    ChangeKind::None
                }
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.kind() != ChangeKind::None
    }

    pub fn initial_state(&self) -> Option<&'a AttributeValue> {
        match self.subject {
            Subject::Root(_) => None,
            Subject::Attribute { initial, .. } => Some(initial),
        }
    }

    pub fn current_state(&self) -> Option<&'a AttributeValue> {
        match self.subject {
            Subject::Root(_) => None,
            Subject::Attribute { current, .. } => Some(current),
        }
    }

    /// The view this model describes, when it describes one.
    pub fn view(&self) -> Option<&'a ViewInstance> {
        match self.subject {
            Subject::Root(view) => Some(view),
            Subject::Attribute { current, .. } => current.as_view(),
        }
    }

    /// Model at a dotted path of singular attributes; the last segment may
    /// name a plural attribute.
    pub fn get(&self, path: &str) -> Result<ChangeModel<'a>> {
        let (head, rest) = split_path(path);
        let child = self.child(head)?;
        match (rest, child) {
            (None, child) => Ok(child),
            (Some(rest), ChangeModel::Singular(nested)) => nested.get(rest),
            (Some(_), other) => Err(Error::kind_mismatch(
                other.path(),
                "a singular attribute (use get_all to cross plural attributes)",
            )),
        }
    }

    /// Models at a dotted path, one per element of every plural attribute
    /// the path crosses.
    pub fn get_all(&self, path: &str) -> Result<Vec<ChangeModel<'a>>> {
        let (head, rest) = split_path(path);
        let child = self.child(head)?;
        match rest {
            None => Ok(vec![child]),
            Some(rest) => child.get_all(rest),
        }
    }

    /// Whether anything at a dotted path changed.
    pub fn is_dirty_path(&self, path: &str) -> Result<bool> {
        Ok(self.get_all(path)?.iter().any(ChangeModel::is_dirty))
    }

    /// Whether the attribute at a dotted path, or any attribute on the way
    /// to it, was replaced or changed.
    pub fn is_changed(&self, path: &str) -> Result<bool> {
        let (head, rest) = split_path(path);
        let child = self.child(head)?;
        if child.kind() == ChangeKind::Updated {
            return Ok(true);
        }
        match (rest, &child) {
            (None, _) => Ok(child.is_dirty()),
            (Some(rest), ChangeModel::Singular(nested)) => nested.is_changed(rest),
            (Some(rest), other) => Ok(other.get_all(rest)?.iter().any(ChangeModel::is_dirty)),
        }
    }

    /// Immediate child attributes that are dirty.
    ///
    /// Basic leaves and references have no child attributes, so for them the
    /// list is empty even when [`is_dirty`](Self::is_dirty) is true. An empty
    /// list only means "clean" for models of views and embeddables.
    pub fn dirty_changes(&self) -> Vec<ChangeModel<'a>> {
        let view = match self.container() {
            Container::Tracked(view) => Some(view),
            Container::Pair(old, new) => new.or(old),
            Container::Leaf => None,
        };
        let Some(view) = view else {
            return Vec::new();
        };
        view.view_type()
            .attributes()
            .iter()
            .filter_map(|decl| self.child(decl.name()).ok())
            .filter(ChangeModel::is_dirty)
            .collect()
    }

    fn container(&self) -> Container<'a> {
        match self.subject {
            Subject::Root(view) => Container::Tracked(view),
            Subject::Attribute {
                initial,
                current,
                flags,
                ..
            } => match (initial.as_view(), current.as_view()) {
                (Some(_), Some(new)) if !flags.replaced || identity_eq(initial, current, None) => {
                    Container::Tracked(new)
                }
                (None, None) => Container::Leaf,
                (old, new) => Container::Pair(old, new),
            },
        }
    }

    fn child(&self, name: &str) -> Result<ChangeModel<'a>> {
        let path = join(&self.path, name);
        let (old, new) = match self.container() {
            Container::Tracked(view) => {
                if is_identity_name(view, name) {
                    let value = view.get(name)?;
                    return Ok(ChangeModel::element(&path, value, value));
                }
                let (index, decl) = view
                    .view_type()
                    .attribute(name)
                    .ok_or_else(|| Error::unknown_attribute(view.view_type().name(), name))?;
                return match (view.values(), view.tracker()) {
                    (Some(values), Some(tracker)) => Ok(ChangeModel::attribute(
                        path,
                        decl,
                        tracker.initial(index),
                        &values[index],
                        tracker.flags(index),
                    )),
                    _ => Err(Error::not_loaded(view.view_type().name())),
                };
            }
            Container::Pair(old, new) => (old, new),
            Container::Leaf => return Err(Error::kind_mismatch(&self.path, "a view")),
        };

        let Some(view_type) = new.or(old).map(ViewInstance::view_type) else {
            return Err(Error::kind_mismatch(&self.path, "a view"));
        };
        if new.or(old).is_some_and(|v| is_identity_name(v, name)) {
            let initial = old.and_then(|v| v.get(name).ok()).unwrap_or(null_value());
            let current = new.and_then(|v| v.get(name).ok()).unwrap_or(null_value());
            return Ok(ChangeModel::element(&path, initial, current));
        }
        let (index, decl) = view_type
            .attribute(name)
            .ok_or_else(|| Error::unknown_attribute(view_type.name(), name))?;
        let value_at = |view: Option<&'a ViewInstance>| {
            view.and_then(ViewInstance::values)
                .map_or(null_value(), |values| &values[index])
        };
        Ok(ChangeModel::attribute(
            path,
            decl,
            value_at(old),
            value_at(new),
            DirtyFlags::REPLACED,
        ))
    }
}

fn is_identity_name(view: &ViewInstance, name: &str) -> bool {
    let view_type = view.view_type();
    view_type.id().is_some_and(|d| d.name == name)
        || view_type.version().is_some_and(|d| d.name == name)
}

/// Change model of a collection attribute.
#[derive(Debug)]
pub struct PluralChangeModel<'a> {
    path: String,
    decl: &'a AttributeDecl,
    initial: &'a AttributeValue,
    current: &'a AttributeValue,
    flags: DirtyFlags,
    delta: CollectionDelta<'a>,
}

impl<'a> PluralChangeModel<'a> {
    fn new(
        path: String,
        decl: &'a AttributeDecl,
        initial: &'a AttributeValue,
        current: &'a AttributeValue,
        flags: DirtyFlags,
    ) -> Self {
        let kind = match decl.kind() {
            AttributeKind::Collection { kind, .. } => *kind,
            _ => Default::default(),
        };
        let delta = collection_delta(
            kind,
            initial.as_collection(),
            current.as_collection(),
            decl.user_type().map(|t| t.as_ref()),
        );
        Self {
            path,
            decl,
            initial,
            current,
            flags,
            delta,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> ChangeKind {
        attribute_dirt(self.decl, self.initial, self.current, self.flags).kind
    }

    pub fn is_dirty(&self) -> bool {
        self.kind() != ChangeKind::None
    }

    /// Elements present now but not in the snapshot.
    pub fn added_elements(&self) -> &[&'a AttributeValue] {
        &self.delta.added
    }

    /// Elements present in the snapshot but not now.
    pub fn removed_elements(&self) -> &[&'a AttributeValue] {
        &self.delta.removed
    }

    /// Elements present in both whose element view changed in place.
    pub fn mutated_elements(&self) -> Vec<&'a AttributeValue> {
        self.delta.mutated.iter().map(|(_, current)| *current).collect()
    }

    /// One model per added, removed and mutated element.
    pub fn element_changes(&self) -> Vec<ChangeModel<'a>> {
        let added = self
            .delta
            .added
            .iter()
            .map(|&e| ChangeModel::element(&self.path, null_value(), e));
        let removed = self
            .delta
            .removed
            .iter()
            .map(|&e| ChangeModel::element(&self.path, e, null_value()));
        let mutated = self
            .delta
            .mutated
            .iter()
            .map(|&(old, new)| ChangeModel::element(&self.path, old, new));
        added.chain(removed).chain(mutated).collect()
    }

    pub fn dirty_changes(&self) -> Vec<ChangeModel<'a>> {
        self.element_changes()
    }

    /// Models at a path inside every current element.
    pub fn get_all(&self, path: &str) -> Result<Vec<ChangeModel<'a>>> {
        let retained = self
            .delta
            .retained
            .iter()
            .map(|&(old, new)| ChangeModel::element(&self.path, old, new));
        let added = self
            .delta
            .added
            .iter()
            .map(|&e| ChangeModel::element(&self.path, null_value(), e));
        let mut models = Vec::new();
        for element in retained.chain(added) {
            models.extend(element.get_all(path)?);
        }
        Ok(models)
    }
}

/// Change model of a map attribute.
#[derive(Debug)]
pub struct MapChangeModel<'a> {
    path: String,
    decl: &'a AttributeDecl,
    initial: &'a AttributeValue,
    current: &'a AttributeValue,
    flags: DirtyFlags,
    delta: MapDelta<'a>,
}

impl<'a> MapChangeModel<'a> {
    fn new(
        path: String,
        decl: &'a AttributeDecl,
        initial: &'a AttributeValue,
        current: &'a AttributeValue,
        flags: DirtyFlags,
    ) -> Self {
        let delta = map_delta(
            initial.as_map(),
            current.as_map(),
            decl.key_user_type().map(|t| t.as_ref()),
            decl.user_type().map(|t| t.as_ref()),
        );
        Self {
            path,
            decl,
            initial,
            current,
            flags,
            delta,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> ChangeKind {
        attribute_dirt(self.decl, self.initial, self.current, self.flags).kind
    }

    pub fn is_dirty(&self) -> bool {
        self.kind() != ChangeKind::None
    }

    pub fn added_keys(&self) -> Vec<&'a AttributeValue> {
        self.delta.added.iter().map(|(k, _)| *k).collect()
    }

    pub fn removed_keys(&self) -> Vec<&'a AttributeValue> {
        self.delta.removed.iter().map(|(k, _)| *k).collect()
    }

    pub fn mutated_keys(&self) -> Vec<&'a AttributeValue> {
        self.delta.mutated_keys.iter().map(|(_, k)| *k).collect()
    }

    /// Elements of new entries plus replacement elements of kept keys.
    pub fn added_elements(&self) -> Vec<&'a AttributeValue> {
        let added = self.delta.added.iter().map(|(_, e)| *e);
        added
            .chain(self.delta.replaced.iter().map(|c| c.current))
            .collect()
    }

    /// Elements of removed entries plus replaced elements of kept keys.
    pub fn removed_elements(&self) -> Vec<&'a AttributeValue> {
        let removed = self.delta.removed.iter().map(|(_, e)| *e);
        removed
            .chain(self.delta.replaced.iter().map(|c| c.initial))
            .collect()
    }

    pub fn mutated_elements(&self) -> Vec<&'a AttributeValue> {
        self.delta.mutated_elements.iter().map(|c| c.current).collect()
    }

    pub fn added_objects(&self) -> Vec<&'a AttributeValue> {
        let mut objects = self.added_keys();
        objects.extend(self.added_elements());
        objects
    }

    pub fn removed_objects(&self) -> Vec<&'a AttributeValue> {
        let mut objects = self.removed_keys();
        objects.extend(self.removed_elements());
        objects
    }

    pub fn mutated_objects(&self) -> Vec<&'a AttributeValue> {
        let mut objects = self.mutated_keys();
        objects.extend(self.mutated_elements());
        objects
    }

    /// One model per added, removed and mutated key.
    pub fn key_changes(&self) -> Vec<ChangeModel<'a>> {
        let added = self
            .delta
            .added
            .iter()
            .map(|&(k, _)| ChangeModel::element(&self.path, null_value(), k));
        let removed = self
            .delta
            .removed
            .iter()
            .map(|&(k, _)| ChangeModel::element(&self.path, k, null_value()));
        let mutated = self
            .delta
            .mutated_keys
            .iter()
            .map(|&(old, new)| ChangeModel::element(&self.path, old, new));
        added.chain(removed).chain(mutated).collect()
    }

    /// One model per added, removed, replaced and mutated element.
    pub fn element_changes(&self) -> Vec<ChangeModel<'a>> {
        let added = self
            .delta
            .added
            .iter()
            .map(|&(_, e)| ChangeModel::element(&self.path, null_value(), e));
        let removed = self
            .delta
            .removed
            .iter()
            .map(|&(_, e)| ChangeModel::element(&self.path, e, null_value()));
        let changed = self
            .delta
            .replaced
            .iter()
            .chain(self.delta.mutated_elements.iter())
            .map(|c| ChangeModel::element(&self.path, c.initial, c.current));
        added.chain(removed).chain(changed).collect()
    }

    /// Key changes followed by element changes.
    pub fn object_changes(&self) -> Vec<ChangeModel<'a>> {
        let mut changes = self.key_changes();
        changes.extend(self.element_changes());
        changes
    }

    pub fn dirty_changes(&self) -> Vec<ChangeModel<'a>> {
        self.object_changes()
    }

    /// Models at a path inside every current element.
    pub fn get_all(&self, path: &str) -> Result<Vec<ChangeModel<'a>>> {
        let mut models = Vec::new();
        let retained = self
            .delta
            .retained
            .iter()
            .map(|c| ChangeModel::element(&self.path, c.initial, c.current));
        let added = self
            .delta
            .added
            .iter()
            .map(|&(_, e)| ChangeModel::element(&self.path, null_value(), e));
        for element in retained.chain(added) {
            models.extend(element.get_all(path)?);
        }
        Ok(models)
    }
}
