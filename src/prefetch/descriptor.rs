use crate::schema::RelationId;

/// One requested relation path, as supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelationDescriptor {
    pub relation: RelationId,
    /// Load the referenced object's (or collection items') own columns, not
    /// only the foreign key.
    pub fetch_fields: bool,
    /// Include lazily loaded columns of the referenced object.
    pub fetch_lazy_fields: bool,
    /// Upper bound of collection items to fetch; `None` fetches all.
    pub item_limit: Option<usize>,
}

impl RelationDescriptor {
    pub fn new(relation: RelationId) -> Self {
        Self {
            relation,
            fetch_fields: true,
            fetch_lazy_fields: false,
            item_limit: None,
        }
    }

    pub fn with_fields(mut self, fetch_fields: bool) -> Self {
        self.fetch_fields = fetch_fields;
        self
    }

    pub fn with_lazy_fields(mut self, fetch_lazy_fields: bool) -> Self {
        self.fetch_lazy_fields = fetch_lazy_fields;
        self
    }

    pub fn limit(mut self, item_limit: usize) -> Self {
        self.item_limit = Some(item_limit);
        self
    }

    /// Descriptor used when a type's default relations are expanded:
    /// references load their key columns only.
    pub(crate) fn default_for(relation: RelationId) -> Self {
        Self::new(relation).with_fields(false)
    }
}

impl From<RelationId> for RelationDescriptor {
    fn from(relation: RelationId) -> Self {
        Self::new(relation)
    }
}
