use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    key::{Key, KeyKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub u32);

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationId(pub u32);

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Sorted, duplicate-free set of column indexes within a type's layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnSet(BTreeSet<usize>);

impl ColumnSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn insert(&mut self, column: usize) -> bool {
        self.0.insert(column)
    }

    pub fn extend(&mut self, columns: impl IntoIterator<Item = usize>) {
        self.0.extend(columns);
    }

    pub fn contains(&self, column: usize) -> bool {
        self.0.contains(&column)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.0.iter().copied().collect()
    }
}

impl FromIterator<usize> for ColumnSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    /// Lazily loaded columns are left out of the default column set.
    pub lazy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationKind {
    /// A plain column on the owner's row.
    Column { column: usize },
    /// A single referenced object whose key is stored in `columns`.
    Reference { target: TypeId, columns: Vec<usize> },
    /// A related collection of `target` objects.
    Collection { target: TypeId },
}

#[derive(Debug, Clone)]
pub struct RelationInfo {
    pub id: RelationId,
    pub name: String,
    pub owner: TypeId,
    pub kind: RelationKind,
}

impl RelationInfo {
    pub fn is_collection(&self) -> bool {
        matches!(self.kind, RelationKind::Collection { .. })
    }
}

#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub id: TypeId,
    pub name: String,
    pub base: Option<TypeId>,
    pub interfaces: Vec<TypeId>,
    pub subtypes: Vec<TypeId>,
    pub is_abstract: bool,
    pub is_interface: bool,
    pub key_width: usize,
    /// Kind of each key value, shared by the whole hierarchy.
    pub key_kinds: Vec<KeyKind>,
    /// Full column layout, inherited columns first.
    pub columns: Vec<ColumnInfo>,
    /// Relations declared on this type (not inherited ones).
    pub relations: Vec<RelationId>,
}

impl TypeInfo {
    /// A leaf type has no subtypes, so a key typed with it is exact.
    pub fn is_leaf(&self) -> bool {
        self.subtypes.is_empty() && !self.is_abstract && !self.is_interface
    }
}

/// Persistent type model consulted when classifying relations.
#[derive(Debug, Clone)]
pub struct Schema {
    types: Vec<TypeInfo>,
    relations: Vec<RelationInfo>,
    by_name: HashMap<String, TypeId>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn type_info(&self, id: TypeId) -> Result<&TypeInfo, Error> {
        self.types
            .get(id.0 as usize)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown type {}", id)))
    }

    pub fn relation(&self, id: RelationId) -> Result<&RelationInfo, Error> {
        self.relations
            .get(id.0 as usize)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown relation {}", id)))
    }

    pub fn type_by_name(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    pub fn relation_by_name(&self, owner: TypeId, name: &str) -> Option<RelationId> {
        self.ancestors(owner)
            .flat_map(|t| self.types[t.0 as usize].relations.iter().copied())
            .find(|r| self.relations[r.0 as usize].name == name)
    }

    /// `id` followed by its bases, nearest first.
    pub fn ancestors(&self, id: TypeId) -> impl Iterator<Item = TypeId> + '_ {
        std::iter::successors(Some(id), move |t| {
            self.types.get(t.0 as usize).and_then(|info| info.base)
        })
    }

    pub fn hierarchy_root(&self, id: TypeId) -> TypeId {
        self.ancestors(id).last().unwrap_or(id)
    }

    pub fn is_leaf(&self, id: TypeId) -> bool {
        self.types
            .get(id.0 as usize)
            .map(TypeInfo::is_leaf)
            .unwrap_or(false)
    }

    /// True when a value of type `id` may be used where `target` is expected:
    /// `target` is `id` itself, one of its bases, or an interface implemented
    /// along the base chain.
    pub fn is_assignable(&self, id: TypeId, target: TypeId) -> bool {
        self.ancestors(id).any(|t| {
            t == target
                || self
                    .types
                    .get(t.0 as usize)
                    .is_some_and(|info| info.interfaces.contains(&target))
        })
    }

    /// True when `id` is a strict descendant of `base`.
    pub fn is_subtype(&self, id: TypeId, base: TypeId) -> bool {
        id != base && self.ancestors(id).any(|t| t == base)
    }

    /// True when some strict descendant of `id` is assignable to `target`,
    /// so an object typed `id` may turn out to satisfy `target` once its
    /// concrete type is known.
    pub fn may_be_assignable(&self, id: TypeId, target: TypeId) -> bool {
        self.types
            .iter()
            .any(|t| self.is_subtype(t.id, id) && self.is_assignable(t.id, target))
    }

    /// Columns loaded when nothing more specific is asked for.
    pub fn default_columns(&self, id: TypeId, include_lazy: bool) -> Result<ColumnSet, Error> {
        let info = self.type_info(id)?;
        Ok(info
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| include_lazy || !c.lazy)
            .map(|(i, _)| i)
            .collect())
    }

    /// Relations that cover the default column set of `id`.
    pub fn default_relations(
        &self,
        id: TypeId,
        include_lazy: bool,
    ) -> Result<Vec<RelationId>, Error> {
        let info = self.type_info(id)?;
        let mut relations = Vec::new();
        for t in self.ancestors(info.id) {
            for rel in &self.types[t.0 as usize].relations {
                let relation = &self.relations[rel.0 as usize];
                let selected = match &relation.kind {
                    RelationKind::Column { column } => include_lazy || !info.columns[*column].lazy,
                    RelationKind::Reference { .. } => true,
                    RelationKind::Collection { .. } => false,
                };
                if selected {
                    relations.push(*rel);
                }
            }
        }
        relations.sort();
        Ok(relations)
    }

    /// Kinds of the key values identifying objects of `id`'s hierarchy.
    pub fn key_kinds(&self, id: TypeId) -> Result<&[KeyKind], Error> {
        Ok(&self.type_info(self.hierarchy_root(id))?.key_kinds)
    }

    /// Decode the key of an object of `id`'s hierarchy from loaded column
    /// values. `None` when a value is null or not of the declared kind.
    pub fn decode_key<'v>(
        &self,
        id: TypeId,
        values: impl IntoIterator<Item = &'v serde_json::Value>,
    ) -> Result<Option<Key>, Error> {
        let kinds = self.key_kinds(id)?;
        let mut decoded = Vec::with_capacity(kinds.len());
        let mut values = values.into_iter();
        for kind in kinds {
            match values.next().and_then(|v| kind.decode(v)) {
                Some(value) => decoded.push(value),
                None => return Ok(None),
            }
        }
        Ok(Some(Key::new(self.hierarchy_root(id), decoded)))
    }

    pub fn types(&self) -> &[TypeInfo] {
        &self.types
    }
}

/// -----------------------------
/// Schema builder
/// -----------------------------

#[derive(Debug, Clone)]
struct TypeDecl {
    name: String,
    base: Option<TypeId>,
    interfaces: Vec<TypeId>,
    is_abstract: bool,
    is_interface: bool,
    key_kinds: Vec<KeyKind>,
    own_columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone)]
enum RelationDecl {
    Column { local: usize },
    Reference { target: TypeId, locals: Vec<usize> },
    Collection { target: TypeId },
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    types: Vec<TypeDecl>,
    relations: Vec<(String, TypeId, RelationDecl)>,
}

impl SchemaBuilder {
    /// Declare the root of a new hierarchy with a key of `key_width`
    /// integer values.
    pub fn root(&mut self, name: &str, key_width: usize) -> TypeId {
        self.keyed_root(name, &vec![KeyKind::Int; key_width])
    }

    /// Declare the root of a new hierarchy whose key values have the given
    /// kinds.
    pub fn keyed_root(&mut self, name: &str, key_kinds: &[KeyKind]) -> TypeId {
        self.push_type(TypeDecl {
            name: name.to_string(),
            base: None,
            interfaces: Vec::new(),
            is_abstract: false,
            is_interface: false,
            key_kinds: key_kinds.to_vec(),
            own_columns: Vec::new(),
        })
    }

    pub fn subtype(&mut self, name: &str, base: TypeId) -> TypeId {
        let key_kinds = self
            .types
            .get(base.0 as usize)
            .map(|t| t.key_kinds.clone())
            .unwrap_or_default();
        self.push_type(TypeDecl {
            name: name.to_string(),
            base: Some(base),
            interfaces: Vec::new(),
            is_abstract: false,
            is_interface: false,
            key_kinds,
            own_columns: Vec::new(),
        })
    }

    pub fn interface(&mut self, name: &str) -> TypeId {
        self.push_type(TypeDecl {
            name: name.to_string(),
            base: None,
            interfaces: Vec::new(),
            is_abstract: true,
            is_interface: true,
            key_kinds: Vec::new(),
            own_columns: Vec::new(),
        })
    }

    pub fn set_abstract(&mut self, id: TypeId) -> &mut Self {
        if let Some(decl) = self.types.get_mut(id.0 as usize) {
            decl.is_abstract = true;
        }
        self
    }

    pub fn implement(&mut self, id: TypeId, interface: TypeId) -> &mut Self {
        if let Some(decl) = self.types.get_mut(id.0 as usize) {
            decl.interfaces.push(interface);
        }
        self
    }

    pub fn column(&mut self, owner: TypeId, name: &str) -> RelationId {
        let local = self.push_column(owner, name, false);
        self.push_relation(name, owner, RelationDecl::Column { local })
    }

    pub fn lazy_column(&mut self, owner: TypeId, name: &str) -> RelationId {
        let local = self.push_column(owner, name, true);
        self.push_relation(name, owner, RelationDecl::Column { local })
    }

    /// Declare a reference; one foreign-key column is added per key value of
    /// the target hierarchy.
    pub fn reference(&mut self, owner: TypeId, name: &str, target: TypeId) -> RelationId {
        let width = self
            .types
            .get(target.0 as usize)
            .map(|t| t.key_kinds.len())
            .unwrap_or(1);
        let locals = (0..width)
            .map(|i| self.push_column(owner, &format!("{}.{}", name, i), false))
            .collect();
        self.push_relation(name, owner, RelationDecl::Reference { target, locals })
    }

    pub fn collection(&mut self, owner: TypeId, name: &str, target: TypeId) -> RelationId {
        self.push_relation(name, owner, RelationDecl::Collection { target })
    }

    pub fn build(self) -> Result<Schema, Error> {
        let mut types: Vec<TypeInfo> = Vec::with_capacity(self.types.len());
        let mut by_name = HashMap::new();

        for (index, decl) in self.types.iter().enumerate() {
            let id = TypeId(index as u32);
            if by_name.insert(decl.name.clone(), id).is_some() {
                return Err(Error::Schema(format!("duplicate type name {}", decl.name)));
            }
            let mut columns = match decl.base {
                Some(base) if (base.0 as usize) < index => {
                    let base_info = &types[base.0 as usize];
                    if base_info.is_interface {
                        return Err(Error::Schema(format!(
                            "{} cannot inherit from interface {}",
                            decl.name, base_info.name
                        )));
                    }
                    base_info.columns.clone()
                }
                Some(_) => {
                    return Err(Error::Schema(format!(
                        "base of {} must be declared before it",
                        decl.name
                    )));
                }
                None => Vec::new(),
            };
            if decl.is_interface && !decl.own_columns.is_empty() {
                return Err(Error::Schema(format!(
                    "interface {} cannot declare columns",
                    decl.name
                )));
            }
            columns.extend(decl.own_columns.iter().cloned());
            for interface in &decl.interfaces {
                let is_interface = self
                    .types
                    .get(interface.0 as usize)
                    .is_some_and(|t| t.is_interface);
                if !is_interface {
                    return Err(Error::Schema(format!(
                        "{} implements {} which is not an interface",
                        decl.name, interface
                    )));
                }
            }
            if let Some(base) = decl.base {
                types[base.0 as usize].subtypes.push(id);
            }
            types.push(TypeInfo {
                id,
                name: decl.name.clone(),
                base: decl.base,
                interfaces: decl.interfaces.clone(),
                subtypes: Vec::new(),
                is_abstract: decl.is_abstract,
                is_interface: decl.is_interface,
                key_width: decl.key_kinds.len(),
                key_kinds: decl.key_kinds.clone(),
                columns,
                relations: Vec::new(),
            });
        }

        let mut relations = Vec::with_capacity(self.relations.len());
        for (index, (name, owner, decl)) in self.relations.into_iter().enumerate() {
            let id = RelationId(index as u32);
            let owner_info = types
                .get(owner.0 as usize)
                .ok_or_else(|| Error::Schema(format!("relation {} has unknown owner", name)))?;
            let base_len = owner_info
                .base
                .map(|b| types[b.0 as usize].columns.len())
                .unwrap_or(0);
            let kind = match decl {
                RelationDecl::Column { local } => RelationKind::Column {
                    column: base_len + local,
                },
                RelationDecl::Reference { target, locals } => {
                    check_target(&types, &name, target)?;
                    RelationKind::Reference {
                        target,
                        columns: locals.into_iter().map(|l| base_len + l).collect(),
                    }
                }
                RelationDecl::Collection { target } => {
                    check_target(&types, &name, target)?;
                    RelationKind::Collection { target }
                }
            };
            types[owner.0 as usize].relations.push(id);
            relations.push(RelationInfo {
                id,
                name,
                owner,
                kind,
            });
        }

        Ok(Schema {
            types,
            relations,
            by_name,
        })
    }

    fn push_type(&mut self, decl: TypeDecl) -> TypeId {
        self.types.push(decl);
        TypeId((self.types.len() - 1) as u32)
    }

    fn push_column(&mut self, owner: TypeId, name: &str, lazy: bool) -> usize {
        match self.types.get_mut(owner.0 as usize) {
            Some(decl) => {
                decl.own_columns.push(ColumnInfo {
                    name: name.to_string(),
                    lazy,
                });
                decl.own_columns.len() - 1
            }
            None => 0,
        }
    }

    fn push_relation(&mut self, name: &str, owner: TypeId, decl: RelationDecl) -> RelationId {
        self.relations.push((name.to_string(), owner, decl));
        RelationId((self.relations.len() - 1) as u32)
    }
}

fn check_target(types: &[TypeInfo], relation: &str, target: TypeId) -> Result<(), Error> {
    match types.get(target.0 as usize) {
        Some(info) if !info.is_interface => Ok(()),
        Some(info) => Err(Error::Schema(format!(
            "relation {} targets interface {}",
            relation, info.name
        ))),
        None => Err(Error::Schema(format!(
            "relation {} targets unknown type {}",
            relation, target
        ))),
    }
}
