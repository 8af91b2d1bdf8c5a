use std::collections::{BTreeMap, BTreeSet};

use crate::builder::TableRouter;
use crate::error::SyncerResult;
use crate::types::TableName;

/// [`TableRouter`] built from explicit source to target rules.
///
/// Tables without a rule are filtered out. DDL is rewritten by replacing the quoted source table
/// with the quoted target table.
#[derive(Debug, Clone, Default)]
pub struct StaticTableRouter {
    routes: BTreeMap<TableName, TableName>,
}

impl StaticTableRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `source` into `target`.
    pub fn route(mut self, source: TableName, target: TableName) -> Self {
        self.routes.insert(source, target);
        self
    }
}

impl TableRouter for StaticTableRouter {
    fn target_table(&self, source: &TableName) -> Option<TableName> {
        self.routes.get(source).cloned()
    }

    fn shard_sources(&self, target: &TableName) -> BTreeSet<TableName> {
        self.routes
            .iter()
            .filter(|(_, routed)| *routed == target)
            .map(|(source, _)| source.clone())
            .collect()
    }

    fn rewrite_ddl(
        &self,
        sql: &str,
        source: &TableName,
        target: &TableName,
    ) -> SyncerResult<Vec<String>> {
        Ok(vec![sql.replace(&source.quoted(), &target.quoted())])
    }
}
