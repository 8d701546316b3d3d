//! Attribute path model.
//!
//! [`ViewMetamodel`] is the registry of view types. Registration validates
//! every declaration against the entity metamodel, binds registered user
//! types to the attributes that use them, and precomputes one path table per
//! view type covering its id, version, own attributes and the leaves of its
//! embeddables (`"address.city"`). Paths through a to-one association are
//! not expanded; [`ViewMetamodel::resolve`] continues in the target's table
//! instead, so recursive view types need no unbounded precomputation.

use crate::user_type::{BasicUserType, UserTypeRegistry};
use crate::view_type::{AttributeKind, BasicType, ElementType, ViewType};
use entityview_core::{ColumnDescriptor, EntityDescriptor, EntityMetamodel, Error, Result};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

const SEGMENT_PATTERN: &str = "^[A-Za-z_][A-Za-z0-9_]*$";

fn segment_regex() -> Result<&'static Regex> {
    static SEGMENT: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    SEGMENT
        .get_or_init(|| Regex::new(SEGMENT_PATTERN))
        .as_ref()
        .map_err(|e| {
            Error::invalid_declaration(format!("path segment pattern failed to compile: {e}"))
        })
}

fn is_valid_segment(name: &str) -> Result<bool> {
    Ok(segment_regex()?.is_match(name))
}

/// What an attribute path addresses within its view type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeRole {
    /// A mutable attribute.
    Normal,
    /// The id attribute.
    Id,
    /// The optimistic lock version attribute.
    Version,
}

/// Static facts about one attribute path, derived once per view type.
#[derive(Debug, Clone)]
pub struct AttributeMetadata {
    /// Path relative to the view type whose table holds this entry.
    pub path: String,
    /// View type declaring the last segment.
    pub declaring_type: String,
    /// Declaration index within `declaring_type`; `None` for id/version.
    pub index: Option<usize>,
    pub kind: AttributeKind,
    pub role: AttributeRole,
    /// Replaceable: the attribute and every enclosing embeddable are
    /// updatable.
    pub updatable: bool,
    /// Plural elements (or the singular value) can change in place.
    pub mutable_elements: bool,
    /// Entity attribute path this attribute projects.
    pub mapping_path: String,
    /// Backing storage; `None` for embeddable containers and for paths of
    /// id-less view types resolved on their own.
    pub column: Option<ColumnDescriptor>,
}

impl AttributeMetadata {
    pub fn is_plural(&self) -> bool {
        self.kind.is_plural()
    }

    /// Column name for single-column mappings.
    pub fn column_name(&self) -> Option<&str> {
        self.column.as_ref().and_then(ColumnDescriptor::column)
    }
}

#[derive(Debug, Default)]
struct PathTable {
    entries: Vec<AttributeMetadata>,
    by_path: HashMap<String, usize>,
}

impl PathTable {
    fn push(&mut self, metadata: AttributeMetadata) {
        self.by_path.insert(metadata.path.clone(), self.entries.len());
        self.entries.push(metadata);
    }

    fn get(&self, path: &str) -> Option<&AttributeMetadata> {
        self.by_path.get(path).map(|&i| &self.entries[i])
    }
}

/// Registry of validated view types.
#[derive(Debug)]
pub struct ViewMetamodel {
    entities: Arc<dyn EntityMetamodel>,
    view_types: HashMap<String, Arc<ViewType>>,
    paths: HashMap<String, PathTable>,
    known_embeddables: HashSet<String>,
    user_types: UserTypeRegistry,
}

impl ViewMetamodel {
    pub fn builder() -> ViewMetamodelBuilder {
        ViewMetamodelBuilder::default()
    }

    /// Registered view type by name.
    pub fn view_type(&self, name: &str) -> Result<&Arc<ViewType>> {
        self.view_types
            .get(name)
            .ok_or_else(|| Error::unknown_view_type(name))
    }

    /// Names of every registered view type.
    pub fn view_type_names(&self) -> impl Iterator<Item = &str> {
        self.view_types.keys().map(String::as_str)
    }

    /// Resolve a dotted path on a view type.
    ///
    /// Paths crossing a to-one association resolve in the target's table;
    /// dereferencing a plural or basic attribute is an unknown attribute.
    pub fn resolve(&self, view_type: &str, path: &str) -> Result<&AttributeMetadata> {
        let table = self
            .paths
            .get(view_type)
            .ok_or_else(|| Error::unknown_view_type(view_type))?;
        if let Some(metadata) = table.get(path) {
            return Ok(metadata);
        }
        for (split, _) in path.match_indices('.') {
            let (prefix, rest) = (&path[..split], &path[split + 1..]);
            match table.get(prefix).map(|m| &m.kind) {
                Some(AttributeKind::ToOne(target)) => return self.resolve(target, rest),
                Some(AttributeKind::Embeddable(_)) | None => {}
                Some(_) => break,
            }
        }
        Err(Error::unknown_attribute(view_type, path))
    }

    /// Every precomputed path of a view type, id and version first, then
    /// attributes in declaration order with embeddable leaves after their
    /// container.
    pub fn attributes(&self, view_type: &str) -> Result<&[AttributeMetadata]> {
        self.paths
            .get(view_type)
            .map(|t| t.entries.as_slice())
            .ok_or_else(|| Error::unknown_view_type(view_type))
    }

    /// Entity descriptor backing an entity view type.
    pub fn entity(&self, view_type: &ViewType) -> Result<&EntityDescriptor> {
        let name = view_type
            .entity()
            .ok_or_else(|| Error::missing_id(view_type.name()))?;
        self.entities
            .entity(name)
            .ok_or_else(|| Error::unmapped(name, view_type.name()))
    }

    pub fn entity_metamodel(&self) -> &dyn EntityMetamodel {
        self.entities.as_ref()
    }

    /// Whether an embeddable view type can be dirty-checked in memory: every
    /// basic leaf is immutable or of a registered user type, recursively,
    /// and it holds no plural attributes.
    pub fn is_known_embeddable(&self, name: &str) -> bool {
        self.known_embeddables.contains(name)
    }

    pub fn user_types(&self) -> &UserTypeRegistry {
        &self.user_types
    }
}

/// Builder for [`ViewMetamodel`].
#[derive(Debug, Default)]
pub struct ViewMetamodelBuilder {
    user_types: UserTypeRegistry,
    view_types: Vec<ViewType>,
}

impl ViewMetamodelBuilder {
    /// Register a basic user type, giving its values deep clone and deep
    /// equality so their changes are proven in memory.
    pub fn user_type(mut self, user_type: impl BasicUserType + 'static) -> Self {
        self.user_types.register(user_type);
        self
    }

    /// Add a view type declaration.
    pub fn register(mut self, view_type: ViewType) -> Self {
        self.view_types.push(view_type);
        self
    }

    /// Validate every declaration and precompute path tables.
    #[tracing::instrument(level = "debug", skip_all, fields(view_types = self.view_types.len()))]
    pub fn build(self, entities: Arc<dyn EntityMetamodel>) -> Result<ViewMetamodel> {
        let mut declared: HashMap<String, ViewType> = HashMap::new();
        for view_type in self.view_types {
            validate_names(&view_type)?;
            if declared.contains_key(view_type.name()) {
                return Err(Error::invalid_declaration(format!(
                    "view type '{}' is registered twice",
                    view_type.name()
                )));
            }
            declared.insert(view_type.name().to_string(), view_type);
        }

        for view_type in declared.values() {
            validate_entity(view_type, entities.as_ref())?;
            validate_references(view_type, &declared)?;
        }
        for view_type in declared.values() {
            check_embeddable_cycle(view_type.name(), &declared, &mut Vec::new())?;
        }

        let mut view_types = HashMap::new();
        for (name, mut view_type) in declared {
            bind_user_types(&mut view_type, &self.user_types);
            view_types.insert(name, Arc::new(view_type));
        }

        let mut paths = HashMap::new();
        for view_type in view_types.values() {
            let table = build_path_table(view_type, &view_types, entities.as_ref())?;
            paths.insert(view_type.name().to_string(), table);
        }

        let known_embeddables: HashSet<String> = view_types
            .values()
            .filter(|v| v.is_embeddable() && is_known(v, &view_types, &mut Vec::new()))
            .map(|v| v.name().to_string())
            .collect();

        tracing::debug!(
            view_types = view_types.len(),
            known_embeddables = known_embeddables.len(),
            user_types = self.user_types.len(),
            "View metamodel built"
        );

        Ok(ViewMetamodel {
            entities,
            view_types,
            paths,
            known_embeddables,
            user_types: self.user_types,
        })
    }
}

fn validate_names(view_type: &ViewType) -> Result<()> {
    let identities = view_type.id().into_iter().chain(view_type.version());
    let names = identities
        .map(|d| d.name.as_str())
        .chain(view_type.attributes().iter().map(|a| a.name()));
    for name in names {
        if !is_valid_segment(name)? {
            return Err(Error::invalid_declaration(format!(
                "attribute name '{name}' of view type '{}' is not a valid path segment",
                view_type.name()
            )));
        }
    }
    if let Some(duplicate) = view_type.duplicate_names().first() {
        return Err(Error::invalid_declaration(format!(
            "attribute '{duplicate}' is declared more than once on view type '{}'",
            view_type.name()
        )));
    }
    Ok(())
}

fn validate_entity(view_type: &ViewType, entities: &dyn EntityMetamodel) -> Result<()> {
    let name = view_type.name();
    match (view_type.entity(), view_type.id()) {
        (Some(entity), Some(_)) => {
            if entities.entity(entity).is_none() {
                return Err(Error::unmapped(entity, name));
            }
            if view_type.version().is_some() && !entities.is_versioned(entity) {
                return Err(Error::invalid_declaration(format!(
                    "view type '{name}' declares a version but entity '{entity}' is not versioned"
                )));
            }
            Ok(())
        }
        (None, None) => {
            if view_type.version().is_some() {
                return Err(Error::invalid_declaration(format!(
                    "embeddable view type '{name}' cannot declare a version"
                )));
            }
            if view_type.is_creatable() {
                return Err(Error::invalid_declaration(format!(
                    "embeddable view type '{name}' cannot be creatable"
                )));
            }
            Ok(())
        }
        (Some(entity), None) => Err(Error::invalid_declaration(format!(
            "view type '{name}' projects entity '{entity}' but declares no id"
        ))),
        (None, Some(_)) => Err(Error::invalid_declaration(format!(
            "view type '{name}' declares an id but no entity"
        ))),
    }
}

fn validate_references(view_type: &ViewType, declared: &HashMap<String, ViewType>) -> Result<()> {
    let lookup = |target: &str| {
        declared
            .get(target)
            .ok_or_else(|| Error::unknown_view_type(target))
    };
    for decl in view_type.attributes() {
        let path = decl.name();
        if decl.is_orphan_removal() {
            let owned = decl.owned_view_type().map(lookup).transpose()?;
            if !owned.is_some_and(|target| !target.is_embeddable()) {
                return Err(Error::invalid_declaration(format!(
                    "orphan removal on '{path}' of '{}' needs entity view elements",
                    view_type.name()
                )));
            }
        }
        match decl.kind() {
            AttributeKind::Basic(_) => {}
            AttributeKind::Embeddable(target) => {
                if !lookup(target)?.is_embeddable() {
                    return Err(Error::invalid_declaration(format!(
                        "embeddable attribute '{path}' points at entity view '{target}'"
                    )));
                }
            }
            AttributeKind::ToOne(target) => {
                if lookup(target)?.is_embeddable() {
                    return Err(Error::invalid_declaration(format!(
                        "to-one attribute '{path}' points at embeddable view '{target}'"
                    )));
                }
            }
            AttributeKind::Collection { element, .. } => {
                if let ElementType::View(target) = element {
                    let target = lookup(target)?;
                    if target.is_embeddable()
                        && target.attributes().iter().any(|a| a.kind().is_plural())
                    {
                        return Err(Error::invalid_declaration(format!(
                            "embeddable element '{}' of '{path}' holds plural attributes",
                            target.name()
                        )));
                    }
                }
            }
            AttributeKind::Map { key, element } => {
                if let ElementType::View(target) = key {
                    if lookup(target)?.is_embeddable() {
                        return Err(Error::invalid_declaration(format!(
                            "map '{path}' uses embeddable view '{target}' as key"
                        )));
                    }
                }
                if let ElementType::View(target) = element {
                    lookup(target)?;
                }
            }
        }
    }
    Ok(())
}

fn check_embeddable_cycle(
    name: &str,
    declared: &HashMap<String, ViewType>,
    stack: &mut Vec<String>,
) -> Result<()> {
    if stack.iter().any(|s| s == name) {
        return Err(Error::invalid_declaration(format!(
            "embeddable cycle through '{}'",
            stack.join(" -> ")
        )));
    }
    let Some(view_type) = declared.get(name) else {
        return Ok(());
    };
    stack.push(name.to_string());
    for decl in view_type.attributes() {
        if let AttributeKind::Embeddable(target) = decl.kind() {
            check_embeddable_cycle(target, declared, stack)?;
        }
    }
    stack.pop();
    Ok(())
}

fn bind_user_types(view_type: &mut ViewType, registry: &UserTypeRegistry) {
    let view_name = view_type.name().to_string();
    for decl in view_type.attributes_mut() {
        let (value_name, key_name) = match decl.kind() {
            AttributeKind::Basic(BasicType::User(name)) => (Some(name.clone()), None),
            AttributeKind::Collection { element, .. } => {
                (element.user_type().map(str::to_string), None)
            }
            AttributeKind::Map { key, element } => (
                element.user_type().map(str::to_string),
                key.user_type().map(str::to_string),
            ),
            _ => (None, None),
        };
        for (name, is_key) in [(value_name, false), (key_name, true)] {
            let Some(name) = name else { continue };
            let bound = registry.get(&name);
            if bound.is_none() {
                tracing::debug!(
                    view_type = %view_name,
                    attribute = %decl.name(),
                    user_type = %name,
                    "User type not registered, changes will be verified by reload"
                );
            }
            if is_key {
                decl.key_type = bound;
            } else {
                decl.value_type = bound;
            }
        }
    }
}

struct TableContext<'a> {
    view_types: &'a HashMap<String, Arc<ViewType>>,
    entities: &'a dyn EntityMetamodel,
    entity: Option<&'a str>,
}

fn build_path_table(
    view_type: &ViewType,
    view_types: &HashMap<String, Arc<ViewType>>,
    entities: &dyn EntityMetamodel,
) -> Result<PathTable> {
    let ctx = TableContext {
        view_types,
        entities,
        entity: view_type.entity(),
    };
    let mut table = PathTable::default();
    let descriptor = ctx.entity.and_then(|e| entities.entity(e));
    let identities = [
        (view_type.id(), AttributeRole::Id),
        (view_type.version(), AttributeRole::Version),
    ];
    for (decl, role) in identities {
        let Some(decl) = decl else { continue };
        let column = descriptor.and_then(|d| {
            let column = match role {
                AttributeRole::Version => d.version_column.clone()?,
                _ => d.id_column.clone(),
            };
            Some(ColumnDescriptor::Column {
                table: d.table.clone(),
                column,
            })
        });
        table.push(AttributeMetadata {
            path: decl.name.clone(),
            declaring_type: view_type.name().to_string(),
            index: None,
            kind: AttributeKind::Basic(BasicType::Immutable),
            role,
            updatable: false,
            mutable_elements: false,
            mapping_path: decl.mapping.clone(),
            column,
        });
    }
    add_attributes(&ctx, view_type, "", "", view_type.is_updatable(), &mut table)?;
    Ok(table)
}

fn add_attributes(
    ctx: &TableContext<'_>,
    view_type: &ViewType,
    prefix: &str,
    mapping_prefix: &str,
    updatable: bool,
    table: &mut PathTable,
) -> Result<()> {
    for (index, decl) in view_type.attributes().iter().enumerate() {
        let path = join(prefix, decl.name());
        let mapping_path = join(mapping_prefix, decl.mapping());
        let column = match decl.kind() {
            AttributeKind::Embeddable(_) => None,
            kind => ctx.resolve(&mapping_path, kind.is_plural())?,
        };
        if let Some(ColumnDescriptor::CollectionTable(collection)) = &column {
            validate_collection_table(ctx, decl.kind(), &mapping_path, collection)?;
        }
        table.push(AttributeMetadata {
            path: path.clone(),
            declaring_type: view_type.name().to_string(),
            index: Some(index),
            kind: decl.kind().clone(),
            role: AttributeRole::Normal,
            updatable: updatable && decl.is_updatable(),
            mutable_elements: has_mutable_values(ctx, decl.kind()),
            mapping_path: mapping_path.clone(),
            column,
        });
        if let AttributeKind::Embeddable(target) = decl.kind() {
            let target = ctx
                .view_types
                .get(target)
                .ok_or_else(|| Error::unknown_view_type(target))?;
            let nested_updatable = updatable && decl.is_updatable() && target.is_updatable();
            add_attributes(ctx, target, &path, &mapping_path, nested_updatable, table)?;
        }
    }
    Ok(())
}

impl TableContext<'_> {
    /// Column backing an entity path; paths of id-less view types resolved
    /// on their own have none.
    fn resolve(&self, mapping_path: &str, plural: bool) -> Result<Option<ColumnDescriptor>> {
        let Some(entity) = self.entity else {
            return Ok(None);
        };
        let column = self
            .entities
            .resolve_column(entity, mapping_path)
            .ok_or_else(|| Error::unmapped(entity, mapping_path))?;
        let is_table = column.collection_table().is_some();
        if is_table != plural {
            return Err(Error::invalid_declaration(format!(
                "'{entity}.{mapping_path}' is mapped to a {} but declared {}",
                if is_table { "collection table" } else { "column" },
                if plural { "plural" } else { "singular" },
            )));
        }
        Ok(Some(column))
    }
}

fn validate_collection_table(
    ctx: &TableContext<'_>,
    kind: &AttributeKind,
    mapping_path: &str,
    collection: &entityview_core::CollectionTable,
) -> Result<()> {
    let entity = ctx.entity.unwrap_or_default();
    let element = match kind {
        AttributeKind::Map { element, .. } => {
            if collection.key_column.is_none() {
                return Err(Error::unmapped(entity, &format!("{mapping_path} (map key)")));
            }
            element
        }
        AttributeKind::Collection { element, .. } => element,
        _ => return Ok(()),
    };
    let leaves = match element {
        ElementType::View(target) => match ctx.view_types.get(target) {
            Some(target) if target.is_embeddable() => leaf_paths(ctx, target, ""),
            _ => vec![String::new()],
        },
        ElementType::Basic(_) => vec![String::new()],
    };
    for leaf in leaves {
        if collection.column_for(&leaf).is_none() {
            let path = if leaf.is_empty() {
                mapping_path.to_string()
            } else {
                format!("{mapping_path}.{leaf}")
            };
            return Err(Error::unmapped(entity, &path));
        }
    }
    Ok(())
}

/// Column-backed leaf paths of an embeddable view, through nested
/// embeddables.
pub(crate) fn leaf_paths_of(
    view_types: &HashMap<String, Arc<ViewType>>,
    view_type: &ViewType,
    prefix: &str,
) -> Vec<String> {
    let mut leaves = Vec::new();
    for decl in view_type.attributes() {
        let path = join(prefix, decl.name());
        match decl.kind() {
            AttributeKind::Embeddable(target) => {
                if let Some(target) = view_types.get(target) {
                    leaves.extend(leaf_paths_of(view_types, target, &path));
                }
            }
            AttributeKind::Basic(_) | AttributeKind::ToOne(_) => leaves.push(path),
            AttributeKind::Collection { .. } | AttributeKind::Map { .. } => {}
        }
    }
    leaves
}

fn leaf_paths(ctx: &TableContext<'_>, view_type: &ViewType, prefix: &str) -> Vec<String> {
    leaf_paths_of(ctx.view_types, view_type, prefix)
}

fn has_mutable_values(ctx: &TableContext<'_>, kind: &AttributeKind) -> bool {
    let mutable_view = |name: &str| ctx.view_types.get(name).is_some_and(|v| v.is_updatable());
    match kind {
        AttributeKind::Basic(BasicType::Immutable) => false,
        AttributeKind::Basic(BasicType::User(_)) => true,
        AttributeKind::Embeddable(name) | AttributeKind::ToOne(name) => mutable_view(name),
        AttributeKind::Collection { element, .. } | AttributeKind::Map { element, .. } => {
            match element {
                ElementType::Basic(BasicType::Immutable) => false,
                ElementType::Basic(BasicType::User(_)) => true,
                ElementType::View(name) => mutable_view(name),
            }
        }
    }
}

fn is_known(
    view_type: &ViewType,
    view_types: &HashMap<String, Arc<ViewType>>,
    stack: &mut Vec<String>,
) -> bool {
    if stack.iter().any(|s| s == view_type.name()) {
        return false;
    }
    stack.push(view_type.name().to_string());
    let known = view_type.attributes().iter().all(|decl| match decl.kind() {
        AttributeKind::Basic(BasicType::Immutable) | AttributeKind::ToOne(_) => true,
        AttributeKind::Basic(BasicType::User(_)) => decl.user_type().is_some(),
        AttributeKind::Embeddable(target) => view_types
            .get(target)
            .is_some_and(|t| is_known(t, view_types, stack)),
        AttributeKind::Collection { .. } | AttributeKind::Map { .. } => false,
    });
    stack.pop();
    known
}

pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}
