use std::sync::Arc;

use serde_json::Value;

use crate::{
    adapters::{MaterializedRow, RawRow, ResultShape, RowMaterializer},
    error::Error,
    key::TypeCertainty,
    schema::{Schema, TypeId},
};

/// Positional materializer for rows laid out as described by `ResultShape`.
pub struct ShapeMaterializer {
    schema: Arc<Schema>,
}

impl ShapeMaterializer {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self { schema }
    }

    fn certainty_of(&self, type_id: TypeId) -> TypeCertainty {
        if self.schema.is_leaf(type_id) {
            TypeCertainty::Exact
        } else if self.schema.hierarchy_root(type_id) == type_id {
            TypeCertainty::Hierarchy
        } else {
            TypeCertainty::Base
        }
    }
}

impl RowMaterializer for ShapeMaterializer {
    fn materialize(&self, shape: &ResultShape, row: &RawRow) -> Result<MaterializedRow, Error> {
        if row.0.len() != shape.width() {
            return Err(Error::Materialize(format!(
                "expected {} values, got {}",
                shape.width(),
                row.0.len()
            )));
        }

        let key_values = &row.0[..shape.key_width];
        let key = self
            .schema
            .decode_key(shape.type_id, key_values)
            .map_err(|e| Error::Materialize(e.to_string()))?
            .ok_or_else(|| {
                Error::Materialize(format!("invalid key {}", Value::from(key_values.to_vec())))
            })?;

        let mut offset = shape.key_width;
        let (type_id, certainty) = if shape.has_discriminator {
            let raw = &row.0[offset];
            offset += 1;
            let type_id = raw
                .as_u64()
                .and_then(|t| u32::try_from(t).ok())
                .map(TypeId)
                .ok_or_else(|| Error::Materialize(format!("invalid discriminator {}", raw)))?;
            if !self.schema.is_assignable(type_id, shape.type_id) {
                return Err(Error::Materialize(format!(
                    "discriminator {} does not belong to {}",
                    type_id, shape.type_id
                )));
            }
            (type_id, TypeCertainty::Exact)
        } else {
            (shape.type_id, self.certainty_of(shape.type_id))
        };

        let values = shape
            .columns
            .iter()
            .copied()
            .zip(row.0[offset..].iter().cloned())
            .collect();

        Ok(MaterializedRow {
            key,
            type_id,
            certainty,
            values,
        })
    }
}
