use std::sync::Arc;

use datafusion::arrow::datatypes::{Schema, SchemaRef};
use datafusion::common::{Constraint, Constraints};

use crate::client::{
    fields_to_schema, schema_to_fields, DatasetName, DatasetResource, TableFieldSchema, TableKind,
    TableName, TableResource,
};
use crate::error::{BigqueryError, Result};

/// A resolved dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigqueryDatasetRef {
    pub name: DatasetName,
    pub location: Option<String>,
}

impl From<DatasetResource> for BigqueryDatasetRef {
    fn from(resource: DatasetResource) -> Self {
        Self {
            name: resource.name,
            location: resource.location,
        }
    }
}

/// A resolved table or view with its host-side schema and constraints.
#[derive(Debug, Clone)]
pub struct BigqueryTableRef {
    pub name: TableName,
    pub kind: TableKind,
    pub fields: Vec<TableFieldSchema>,
    pub schema: SchemaRef,
    pub constraints: Constraints,
    pub view_query: Option<String>,
}

impl BigqueryTableRef {
    /// Translate warehouse metadata into host descriptors.
    pub fn from_resource(resource: TableResource) -> Result<Self> {
        let schema = Arc::new(fields_to_schema(&resource.fields));
        let constraints = if resource.primary_key.is_empty() {
            Constraints::default()
        } else {
            let indices = resource
                .primary_key
                .iter()
                .map(|key| {
                    schema.index_of(key).map_err(|_| {
                        BigqueryError::Decode(format!(
                            "primary key column '{key}' missing from {}",
                            resource.name
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Constraints::new_unverified(vec![Constraint::PrimaryKey(indices)])
        };
        Ok(Self {
            name: resource.name,
            kind: resource.kind,
            fields: resource.fields,
            schema,
            constraints,
            view_query: resource.view_query,
        })
    }

    pub fn is_view(&self) -> bool {
        self.kind == TableKind::View
    }

    /// Primary key column names, in key order.
    pub fn primary_key(&self) -> Vec<String> {
        primary_key_names(&self.schema, &self.constraints)
    }
}

/// Build a table resource for CREATE TABLE from host descriptors.
///
/// Unique constraints have no warehouse counterpart and are dropped; the first
/// primary key becomes the NOT ENFORCED key.
pub fn table_resource(
    name: TableName,
    schema: &Schema,
    constraints: &Constraints,
) -> Result<TableResource> {
    Ok(TableResource {
        name,
        kind: TableKind::Table,
        fields: schema_to_fields(schema)?,
        primary_key: primary_key_names(schema, constraints),
        view_query: None,
    })
}

fn primary_key_names(schema: &Schema, constraints: &Constraints) -> Vec<String> {
    constraints
        .iter()
        .find_map(|c| match c {
            Constraint::PrimaryKey(indices) => Some(
                indices
                    .iter()
                    .filter_map(|i| schema.fields().get(*i).map(|f| f.name().clone()))
                    .collect(),
            ),
            Constraint::Unique(_) => None,
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{FieldMode, FieldType};
    use datafusion::arrow::datatypes::{DataType, Field};

    fn resource() -> TableResource {
        TableResource {
            name: DatasetName::new("p", "d").table("t"),
            kind: TableKind::Table,
            fields: vec![
                TableFieldSchema::new("id", FieldType::Int64).with_mode(FieldMode::Required),
                TableFieldSchema::new("name", FieldType::String),
            ],
            primary_key: vec!["id".to_string()],
            view_query: None,
        }
    }

    #[test]
    fn test_from_resource_maps_schema_and_key() {
        let table = BigqueryTableRef::from_resource(resource()).unwrap();
        assert_eq!(table.schema.field(0).data_type(), &DataType::Int64);
        assert!(!table.schema.field(0).is_nullable());
        assert!(table.schema.field(1).is_nullable());
        assert_eq!(
            table.constraints,
            Constraints::new_unverified(vec![Constraint::PrimaryKey(vec![0])])
        );
        assert_eq!(table.primary_key(), vec!["id".to_string()]);
    }

    #[test]
    fn test_unknown_primary_key_column_is_error() {
        let mut bad = resource();
        bad.primary_key = vec!["nope".to_string()];
        assert!(BigqueryTableRef::from_resource(bad).is_err());
    }

    #[test]
    fn test_table_resource_from_host_schema() {
        let schema = Schema::new(vec![
            Field::new("a", DataType::Int32, false),
            Field::new("b", DataType::Utf8, true),
        ]);
        let constraints = Constraints::new_unverified(vec![
            Constraint::Unique(vec![1]),
            Constraint::PrimaryKey(vec![0]),
        ]);
        let name = DatasetName::new("p", "d").table("t");
        let resource = table_resource(name, &schema, &constraints).unwrap();
        assert_eq!(resource.primary_key, vec!["a".to_string()]);
        assert_eq!(resource.fields[0].field_type, FieldType::Int64);
        assert_eq!(resource.fields[0].mode, FieldMode::Required);
    }
}
