//! Declarative view type schemas.
//!
//! A [`ViewType`] is the static description of one view: which entity it
//! projects, its id and version attributes, and the ordered list of mutable
//! attributes. Instances address attributes by index into that list, which
//! is what the dirty state tracker keys its snapshots on.
//!
//! View types are declared with [`ViewType::builder`] and become usable once
//! registered with a [`ViewMetamodel`](crate::path::ViewMetamodel), which
//! validates them against the entity metamodel and binds user types.

use crate::config::{FlushMode, FlushStrategy};
use crate::user_type::BasicUserType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Ordering and uniqueness semantics of a collection attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionKind {
    /// Unordered, elements unique by identity.
    #[default]
    Set,
    /// Ordered, duplicates allowed.
    List,
}

/// Type of a BASIC value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BasicType {
    /// A plain column value that can only be replaced.
    Immutable,
    /// A mutable application value of the named user type.
    User(String),
}

/// Type of a collection element or map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// Basic values.
    Basic(BasicType),
    /// Views of the named type: entity views when it declares an id,
    /// embeddable views otherwise.
    View(String),
}

impl ElementType {
    /// Plain column values.
    pub fn basic() -> Self {
        ElementType::Basic(BasicType::Immutable)
    }

    /// Values of a user type.
    pub fn user(type_name: impl Into<String>) -> Self {
        ElementType::Basic(BasicType::User(type_name.into()))
    }

    /// Views of a view type.
    pub fn view(view_type: impl Into<String>) -> Self {
        ElementType::View(view_type.into())
    }

    /// View type name, if the elements are views.
    pub fn view_type(&self) -> Option<&str> {
        match self {
            ElementType::View(name) => Some(name),
            ElementType::Basic(_) => None,
        }
    }

    /// User type name, if the elements are user values.
    pub fn user_type(&self) -> Option<&str> {
        match self {
            ElementType::Basic(BasicType::User(name)) => Some(name),
            _ => None,
        }
    }
}

/// Attribute kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    /// A single value stored in one column.
    Basic(BasicType),
    /// A flat view whose attributes are columns of the owning row.
    Embeddable(String),
    /// A reference to another entity view, stored as a foreign key.
    ToOne(String),
    /// A collection stored in a collection or join table.
    Collection {
        element: ElementType,
        kind: CollectionKind,
    },
    /// A map stored in a collection table with a key column.
    Map { key: ElementType, element: ElementType },
}

impl AttributeKind {
    /// Whether the attribute holds a collection or a map.
    pub fn is_plural(&self) -> bool {
        matches!(self, AttributeKind::Collection { .. } | AttributeKind::Map { .. })
    }

    /// View type a singular attribute points into.
    pub fn singular_view_type(&self) -> Option<&str> {
        match self {
            AttributeKind::Embeddable(name) | AttributeKind::ToOne(name) => Some(name),
            _ => None,
        }
    }

    /// Element type of a plural attribute.
    pub fn element_type(&self) -> Option<&ElementType> {
        match self {
            AttributeKind::Collection { element, .. } | AttributeKind::Map { element, .. } => {
                Some(element)
            }
            _ => None,
        }
    }

    /// Short uppercase label used in logs and errors.
    pub fn label(&self) -> &'static str {
        match self {
            AttributeKind::Basic(_) => "BASIC",
            AttributeKind::Embeddable(_) => "EMBEDDABLE",
            AttributeKind::ToOne(_) => "TO_ONE",
            AttributeKind::Collection { .. } => "COLLECTION",
            AttributeKind::Map { .. } => "MAP",
        }
    }
}

/// Declaration of one mutable attribute.
#[derive(Debug, Clone)]
pub struct AttributeDecl {
    name: String,
    mapping: String,
    kind: AttributeKind,
    updatable: bool,
    orphan_removal: bool,
    pub(crate) value_type: Option<Arc<dyn BasicUserType>>,
    pub(crate) key_type: Option<Arc<dyn BasicUserType>>,
}

impl AttributeDecl {
    fn new(name: impl Into<String>, kind: AttributeKind) -> Self {
        let name = name.into();
        Self {
            mapping: name.clone(),
            name,
            kind,
            updatable: true,
            orphan_removal: false,
            value_type: None,
            key_type: None,
        }
    }

    /// Immutable basic attribute.
    pub fn basic(name: impl Into<String>) -> Self {
        Self::new(name, AttributeKind::Basic(BasicType::Immutable))
    }

    /// Basic attribute holding values of a user type.
    pub fn user(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self::new(name, AttributeKind::Basic(BasicType::User(type_name.into())))
    }

    /// Embeddable attribute.
    pub fn embeddable(name: impl Into<String>, view_type: impl Into<String>) -> Self {
        Self::new(name, AttributeKind::Embeddable(view_type.into()))
    }

    /// Singular association to another entity view.
    pub fn to_one(name: impl Into<String>, view_type: impl Into<String>) -> Self {
        Self::new(name, AttributeKind::ToOne(view_type.into()))
    }

    /// Collection attribute.
    pub fn collection(name: impl Into<String>, element: ElementType, kind: CollectionKind) -> Self {
        Self::new(name, AttributeKind::Collection { element, kind })
    }

    /// Map attribute.
    pub fn map(name: impl Into<String>, key: ElementType, element: ElementType) -> Self {
        Self::new(name, AttributeKind::Map { key, element })
    }

    /// Entity attribute this attribute projects, when it differs from the name.
    pub fn mapped_by(mut self, mapping: impl Into<String>) -> Self {
        self.mapping = mapping.into();
        self
    }

    /// Forbid replacing or mutating this attribute.
    pub fn read_only(mut self) -> Self {
        self.updatable = false;
        self
    }

    /// The entity views this attribute holds are owned by its view: one
    /// dropped from the attribute is deleted, and all of them are deleted
    /// with the owner. Only valid for to-one and plural attributes of
    /// entity views.
    pub fn orphan_removal(mut self) -> Self {
        self.orphan_removal = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mapping(&self) -> &str {
        &self.mapping
    }

    pub fn kind(&self) -> &AttributeKind {
        &self.kind
    }

    pub fn is_updatable(&self) -> bool {
        self.updatable
    }

    pub fn is_orphan_removal(&self) -> bool {
        self.orphan_removal
    }

    /// View type of the entity views an orphan-removal attribute owns.
    pub(crate) fn owned_view_type(&self) -> Option<&str> {
        if !self.orphan_removal {
            return None;
        }
        match &self.kind {
            AttributeKind::ToOne(target) => Some(target),
            AttributeKind::Collection { element, .. } | AttributeKind::Map { element, .. } => {
                element.view_type()
            }
            _ => None,
        }
    }

    /// Registered user type of a basic value or of plural elements.
    pub fn user_type(&self) -> Option<&Arc<dyn BasicUserType>> {
        self.value_type.as_ref()
    }

    /// Registered user type of map keys.
    pub fn key_user_type(&self) -> Option<&Arc<dyn BasicUserType>> {
        self.key_type.as_ref()
    }

    /// Whether values of this attribute can be proven unchanged in memory.
    ///
    /// False for user types without a registered capability.
    pub fn is_provable(&self) -> bool {
        let value_ok = match &self.kind {
            AttributeKind::Basic(BasicType::User(_)) => self.value_type.is_some(),
            AttributeKind::Collection { element, .. } | AttributeKind::Map { element, .. } => {
                element.user_type().is_none() || self.value_type.is_some()
            }
            _ => true,
        };
        let key_ok = match &self.kind {
            AttributeKind::Map { key, .. } => key.user_type().is_none() || self.key_type.is_some(),
            _ => true,
        };
        value_ok && key_ok
    }
}

/// Id or version attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityDecl {
    /// Attribute name.
    pub name: String,
    /// Entity attribute it projects.
    pub mapping: String,
}

/// Static description of a view.
#[derive(Debug, Clone)]
pub struct ViewType {
    name: String,
    entity: Option<String>,
    id: Option<IdentityDecl>,
    version: Option<IdentityDecl>,
    attributes: Vec<AttributeDecl>,
    by_name: HashMap<String, usize>,
    updatable: bool,
    creatable: bool,
    flush_mode: Option<FlushMode>,
    flush_strategy: Option<FlushStrategy>,
}

impl ViewType {
    /// Start declaring a view type.
    pub fn builder(name: impl Into<String>) -> ViewTypeBuilder {
        ViewTypeBuilder {
            inner: ViewType {
                name: name.into(),
                entity: None,
                id: None,
                version: None,
                attributes: Vec::new(),
                by_name: HashMap::new(),
                updatable: true,
                creatable: false,
                flush_mode: None,
                flush_strategy: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entity projected by this view; `None` for embeddable views.
    pub fn entity(&self) -> Option<&str> {
        self.entity.as_deref()
    }

    pub fn id(&self) -> Option<&IdentityDecl> {
        self.id.as_ref()
    }

    pub fn version(&self) -> Option<&IdentityDecl> {
        self.version.as_ref()
    }

    /// Whether this is an embeddable (id-less) view.
    pub fn is_embeddable(&self) -> bool {
        self.id.is_none()
    }

    /// Mutable attributes in declaration order.
    pub fn attributes(&self) -> &[AttributeDecl] {
        &self.attributes
    }

    /// Attribute at a declaration index.
    pub fn attribute_at(&self, index: usize) -> Option<&AttributeDecl> {
        self.attributes.get(index)
    }

    /// Declaration index of an attribute.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Attribute and its index by name.
    pub fn attribute(&self, name: &str) -> Option<(usize, &AttributeDecl)> {
        let index = self.index_of(name)?;
        Some((index, &self.attributes[index]))
    }

    /// Whether instances of this type accept mutation.
    pub fn is_updatable(&self) -> bool {
        self.updatable
    }

    /// Whether new instances can be created and persisted.
    pub fn is_creatable(&self) -> bool {
        self.creatable
    }

    pub fn flush_mode(&self) -> Option<FlushMode> {
        self.flush_mode
    }

    pub fn flush_strategy(&self) -> Option<FlushStrategy> {
        self.flush_strategy
    }

    pub(crate) fn attributes_mut(&mut self) -> &mut [AttributeDecl] {
        &mut self.attributes
    }

    /// Names declared more than once, including clashes with id/version.
    pub(crate) fn duplicate_names(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        let mut dups = Vec::new();
        let identities = self.id.iter().chain(self.version.iter()).map(|d| d.name.as_str());
        for name in identities.chain(self.attributes.iter().map(|a| a.name.as_str())) {
            if seen.contains(&name) {
                dups.push(name);
            } else {
                seen.push(name);
            }
        }
        dups
    }
}

/// Builder for [`ViewType`].
#[derive(Debug)]
pub struct ViewTypeBuilder {
    inner: ViewType,
}

impl ViewTypeBuilder {
    /// Entity projected by the view.
    pub fn entity(mut self, entity: impl Into<String>) -> Self {
        self.inner.entity = Some(entity.into());
        self
    }

    /// Id attribute mapped to the entity attribute of the same name.
    pub fn id(self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.id_mapped(name.clone(), name)
    }

    /// Id attribute mapped to a differently named entity attribute.
    pub fn id_mapped(mut self, name: impl Into<String>, mapping: impl Into<String>) -> Self {
        self.inner.id = Some(IdentityDecl {
            name: name.into(),
            mapping: mapping.into(),
        });
        self
    }

    /// Version attribute used for optimistic locking.
    pub fn version(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.inner.version = Some(IdentityDecl {
            mapping: name.clone(),
            name,
        });
        self
    }

    /// Add an attribute declaration.
    pub fn attribute(mut self, decl: AttributeDecl) -> Self {
        self.inner
            .by_name
            .insert(decl.name.clone(), self.inner.attributes.len());
        self.inner.attributes.push(decl);
        self
    }

    pub fn basic(self, name: impl Into<String>) -> Self {
        self.attribute(AttributeDecl::basic(name))
    }

    pub fn user(self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.attribute(AttributeDecl::user(name, type_name))
    }

    pub fn embeddable(self, name: impl Into<String>, view_type: impl Into<String>) -> Self {
        self.attribute(AttributeDecl::embeddable(name, view_type))
    }

    pub fn to_one(self, name: impl Into<String>, view_type: impl Into<String>) -> Self {
        self.attribute(AttributeDecl::to_one(name, view_type))
    }

    pub fn set(self, name: impl Into<String>, element: ElementType) -> Self {
        self.attribute(AttributeDecl::collection(name, element, CollectionKind::Set))
    }

    pub fn list(self, name: impl Into<String>, element: ElementType) -> Self {
        self.attribute(AttributeDecl::collection(name, element, CollectionKind::List))
    }

    pub fn map(self, name: impl Into<String>, key: ElementType, element: ElementType) -> Self {
        self.attribute(AttributeDecl::map(name, key, element))
    }

    /// Make instances of this type immutable.
    pub fn read_only(mut self) -> Self {
        self.inner.updatable = false;
        self
    }

    /// Allow new instances to be created and inserted.
    pub fn creatable(mut self) -> Self {
        self.inner.creatable = true;
        self
    }

    /// Override the flush mode for this view type.
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.inner.flush_mode = Some(mode);
        self
    }

    /// Override the flush strategy for this view type.
    pub fn flush_strategy(mut self, strategy: FlushStrategy) -> Self {
        self.inner.flush_strategy = Some(strategy);
        self
    }

    /// Finish the declaration; validation happens at registration.
    pub fn build(self) -> ViewType {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_indexes_attributes() {
        let view = ViewType::builder("DocView")
            .entity("Document")
            .id("id")
            .version("version")
            .basic("name")
            .set("tags", ElementType::basic())
            .build();

        assert_eq!(view.attributes().len(), 2);
        assert_eq!(view.index_of("tags"), Some(1));
        assert!(view.attribute("id").is_none());
        assert_eq!(view.id().map(|d| d.name.as_str()), Some("id"));
        assert!(!view.is_embeddable());
        assert!(view.duplicate_names().is_empty());
    }

    #[test]
    fn test_duplicates_include_identity_names() {
        let view = ViewType::builder("DocView")
            .id("id")
            .basic("id")
            .basic("name")
            .basic("name")
            .build();
        assert_eq!(view.duplicate_names(), vec!["id", "name"]);
    }

    #[test]
    fn test_provability_of_user_types() {
        let plain = AttributeDecl::basic("name");
        assert!(plain.is_provable());
        let unbound = AttributeDecl::user("payload", "json");
        assert!(!unbound.is_provable());
        let elements =
            AttributeDecl::collection("names", ElementType::basic(), CollectionKind::List);
        assert!(elements.is_provable());
        assert_eq!(elements.kind().label(), "COLLECTION");
    }

    #[test]
    fn test_mapping_defaults_to_name() {
        let decl = AttributeDecl::basic("title");
        assert_eq!(decl.mapping(), "title");
        let decl = AttributeDecl::basic("title").mapped_by("heading").read_only();
        assert_eq!(decl.mapping(), "heading");
        assert!(!decl.is_updatable());
    }
}
