//! Statement-level write detection.
//!
//! Planning resolves every referenced table against its catalog, so a
//! CREATE TABLE aimed at a read-only database would reach the warehouse
//! before any provider could refuse it. The engine checks parsed statements
//! against the attached access modes first.

use datafusion::error::Result as DFResult;
use datafusion::sql::parser::Statement as DFStatement;
use datafusion::sql::planner::object_name_to_table_reference;
use datafusion::sql::sqlparser::ast::{ObjectName, ObjectType, SchemaName, Statement, TableObject};

/// A catalog a statement writes to and the operation it performs there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTarget {
    pub catalog: String,
    pub operation: &'static str,
}

enum Scope<'a> {
    Table(&'a ObjectName),
    Dataset(&'a ObjectName),
}

/// Catalogs `statement` would create, drop or write objects in.
pub fn write_targets(
    statement: &DFStatement,
    default_catalog: &str,
    normalize: bool,
) -> DFResult<Vec<WriteTarget>> {
    let DFStatement::Statement(inner) = statement else {
        return Ok(Vec::new());
    };
    let scoped: Vec<(Scope<'_>, &'static str)> = match inner.as_ref() {
        Statement::CreateTable(create) => vec![(Scope::Table(&create.name), "create tables")],
        Statement::CreateView { name, .. } => vec![(Scope::Table(name), "create views")],
        Statement::Insert(insert) => match &insert.table {
            TableObject::TableName(name) => vec![(Scope::Table(name), "insert into tables")],
            _ => Vec::new(),
        },
        Statement::CreateSchema {
            schema_name: SchemaName::Simple(name) | SchemaName::NamedAuthorization(name, _),
            ..
        } => vec![(Scope::Dataset(name), "create datasets")],
        Statement::Drop {
            object_type, names, ..
        } => {
            let scope = |name| match object_type {
                ObjectType::Table => Some((Scope::Table(name), "drop tables")),
                ObjectType::View => Some((Scope::Table(name), "drop views")),
                ObjectType::Schema => Some((Scope::Dataset(name), "drop datasets")),
                _ => None,
            };
            names.iter().filter_map(scope).collect()
        }
        _ => Vec::new(),
    };

    scoped
        .into_iter()
        .map(|(scope, operation)| {
            let catalog = match scope {
                Scope::Table(name) => object_name_to_table_reference(name.clone(), normalize)?
                    .catalog()
                    .map(str::to_string),
                // `catalog.dataset` parses as a partial table reference
                Scope::Dataset(name) => object_name_to_table_reference(name.clone(), normalize)?
                    .schema()
                    .map(str::to_string),
            };
            Ok(WriteTarget {
                catalog: catalog.unwrap_or_else(|| default_catalog.to_string()),
                operation,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::sql::parser::DFParser;

    fn targets(sql: &str) -> Vec<(String, &'static str)> {
        let statement = DFParser::parse_sql(sql).unwrap().pop_front().unwrap();
        write_targets(&statement, "datafusion", true)
            .unwrap()
            .into_iter()
            .map(|t| (t.catalog, t.operation))
            .collect()
    }

    #[test]
    fn test_table_ddl_targets() {
        assert_eq!(
            targets("CREATE TABLE db1.ds.x (a BIGINT)"),
            vec![("db1".to_string(), "create tables")]
        );
        assert_eq!(
            targets("CREATE TABLE ds.x AS SELECT 1"),
            vec![("datafusion".to_string(), "create tables")]
        );
        assert_eq!(
            targets("DROP VIEW db1.ds.v"),
            vec![("db1".to_string(), "drop views")]
        );
        assert_eq!(
            targets("INSERT INTO db2.ds.t VALUES (1)"),
            vec![("db2".to_string(), "insert into tables")]
        );
    }

    #[test]
    fn test_dataset_ddl_targets() {
        assert_eq!(
            targets("CREATE SCHEMA db1.staging"),
            vec![("db1".to_string(), "create datasets")]
        );
        assert_eq!(
            targets("DROP SCHEMA staging"),
            vec![("datafusion".to_string(), "drop datasets")]
        );
    }

    #[test]
    fn test_queries_write_nothing() {
        assert!(targets("SELECT * FROM db1.ds.people").is_empty());
        assert!(targets("EXPLAIN SELECT 1").is_empty());
    }
}
