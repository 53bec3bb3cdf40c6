use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

impl ColumnSchema {
    pub fn new(name: &str, data_type: &str, nullable: bool) -> Self {
        Self {
            name: name.to_lowercase(),
            data_type: data_type.to_string(),
            nullable,
        }
    }

    /// `name (TYPE)` or `name (TYPE, NOT NULL)`, as listed in prompts
    pub fn describe(&self) -> String {
        if self.nullable {
            format!("{} ({})", self.name, self.data_type)
        } else {
            format!("{} ({}, NOT NULL)", self.name, self.data_type)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

impl ForeignKey {
    pub fn new(column: &str, referenced_table: &str, referenced_column: &str) -> Self {
        Self {
            column: column.to_lowercase(),
            referenced_table: referenced_table.to_lowercase(),
            referenced_column: referenced_column.to_lowercase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    /// Builds a table, lowercasing its name and dropping repeated column names.
    pub fn new(name: &str, columns: Vec<ColumnSchema>) -> Self {
        let mut seen = HashSet::new();
        let columns = columns
            .into_iter()
            .map(|c| ColumnSchema { name: c.name.to_lowercase(), ..c })
            .filter(|c| seen.insert(c.name.clone()))
            .collect();

        Self {
            name: name.to_lowercase(),
            columns,
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_foreign_keys(mut self, foreign_keys: Vec<ForeignKey>) -> Self {
        self.foreign_keys = foreign_keys;
        self
    }

    pub fn has_column(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.columns.iter().any(|c| c.name == name)
    }

    /// Compact listing used as LLM context
    pub fn describe(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| c.describe()).collect();
        let mut text = format!("Table: {}\nColumns: {}\n", self.name, columns.join(", "));

        if !self.foreign_keys.is_empty() {
            let fks: Vec<String> = self
                .foreign_keys
                .iter()
                .map(|fk| {
                    format!(
                        "{} -> {}.{}",
                        fk.column, fk.referenced_table, fk.referenced_column
                    )
                })
                .collect();
            text.push_str(&format!("Foreign keys: {}\n", fks.join(", ")));
        }

        text
    }
}

/// Immutable picture of the catalog at one point in time.
///
/// Shared behind an `Arc` by the schema cache and replaced wholesale on
/// refresh.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaSnapshot {
    pub schema_name: String,
    pub tables: Vec<TableSchema>,
    pub captured_at: DateTime<Utc>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl SchemaSnapshot {
    pub fn new(schema_name: &str, tables: Vec<TableSchema>) -> Self {
        let mut index = HashMap::new();
        let mut unique = Vec::with_capacity(tables.len());

        for table in tables {
            let table = TableSchema::new(&table.name, table.columns)
                .with_foreign_keys(table.foreign_keys);
            if index.contains_key(&table.name) {
                continue;
            }
            index.insert(table.name.clone(), unique.len());
            unique.push(table);
        }

        Self {
            schema_name: schema_name.to_lowercase(),
            tables: unique,
            captured_at: Utc::now(),
            index,
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.index
            .get(&name.to_lowercase())
            .map(|&i| &self.tables[i])
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.index.contains_key(&name.to_lowercase())
    }

    /// True if any table in the snapshot has a column with this name
    pub fn has_column(&self, name: &str) -> bool {
        self.tables.iter().any(|t| t.has_column(name))
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customers() -> TableSchema {
        TableSchema::new(
            "Customers",
            vec![
                ColumnSchema::new("ID", "INTEGER", false),
                ColumnSchema::new("name", "VARCHAR", true),
                ColumnSchema::new("Name", "VARCHAR", true),
            ],
        )
    }

    #[test]
    fn test_names_are_lowercased_and_unique() {
        let table = customers();
        assert_eq!(table.name, "customers");
        assert_eq!(table.columns.len(), 2);
        assert_eq!(table.columns[0].name, "id");
        assert!(table.has_column("NAME"));
    }

    #[test]
    fn test_snapshot_keeps_first_duplicate_table() {
        let other = TableSchema::new("CUSTOMERS", vec![ColumnSchema::new("x", "INTEGER", true)]);
        let snapshot = SchemaSnapshot::new("Main", vec![customers(), other]);

        assert_eq!(snapshot.schema_name, "main");
        assert_eq!(snapshot.table_count(), 1);
        assert!(snapshot.table("customers").unwrap().has_column("id"));
        assert!(!snapshot.has_column("x"));
    }

    #[test]
    fn test_describe_lists_columns_and_foreign_keys() {
        let orders = TableSchema::new(
            "orders",
            vec![
                ColumnSchema::new("id", "INTEGER", false),
                ColumnSchema::new("customer_id", "INTEGER", true),
            ],
        )
        .with_foreign_keys(vec![ForeignKey::new("customer_id", "Customers", "ID")]);

        assert_eq!(
            orders.describe(),
            "Table: orders\nColumns: id (INTEGER, NOT NULL), customer_id (INTEGER)\nForeign keys: customer_id -> customers.id\n"
        );
    }
}
