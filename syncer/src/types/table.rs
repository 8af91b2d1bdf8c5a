use std::fmt;

use serde::{Deserialize, Serialize};

/// Fully qualified name of a table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Quoted form, `` `schema`.`name` ``, used as table identity for routing.
    pub fn quoted(&self) -> String {
        format!(
            "`{}`.`{}`",
            self.schema.replace('`', "``"),
            self.name.replace('`', "``")
        )
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.quoted())
    }
}

/// Structure of one column of a target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub primary: bool,
    pub unique: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
            primary: false,
            unique: false,
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Structural descriptor of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: TableName,
    pub column_schemas: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(name: TableName, column_schemas: Vec<ColumnSchema>) -> Self {
        Self {
            name,
            column_schemas,
        }
    }

    pub fn column_names(&self) -> Vec<String> {
        self.column_schemas
            .iter()
            .map(|column| column.name.clone())
            .collect()
    }

    /// Indexes of the columns identifying a row.
    ///
    /// Uses the primary key, then the first not null unique column, and all columns when the
    /// table has neither.
    pub fn key_column_indexes(&self) -> Vec<usize> {
        let primary: Vec<usize> = self
            .column_schemas
            .iter()
            .enumerate()
            .filter(|(_, column)| column.primary)
            .map(|(index, _)| index)
            .collect();
        if !primary.is_empty() {
            return primary;
        }

        if let Some(index) = self
            .column_schemas
            .iter()
            .position(|column| column.unique && !column.nullable)
        {
            return vec![index];
        }

        (0..self.column_schemas.len()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_table_identity() {
        assert_eq!(TableName::new("test", "t1").quoted(), "`test`.`t1`");
        assert_eq!(TableName::new("a`b", "t").to_string(), "`a``b`.`t`");
    }

    #[test]
    fn key_columns_prefer_primary_then_unique() {
        let name = TableName::new("test", "tb");
        let with_primary = TableSchema::new(
            name.clone(),
            vec![
                ColumnSchema::new("id", "int", false).primary(),
                ColumnSchema::new("col1", "int", false).unique(),
            ],
        );
        let with_unique = TableSchema::new(
            name.clone(),
            vec![
                ColumnSchema::new("a", "int", true),
                ColumnSchema::new("b", "int", false).unique(),
            ],
        );
        let without_keys = TableSchema::new(
            name,
            vec![
                ColumnSchema::new("a", "int", true),
                ColumnSchema::new("b", "int", true),
            ],
        );

        assert_eq!(with_primary.key_column_indexes(), vec![0]);
        assert_eq!(with_unique.key_column_indexes(), vec![1]);
        assert_eq!(without_keys.key_column_indexes(), vec![0, 1]);
    }
}
