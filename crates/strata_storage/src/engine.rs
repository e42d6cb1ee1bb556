//! Table registry. All tables of one engine share a transaction manager.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use strata_common::config::StorageConfig;
use strata_common::error::StorageError;
use strata_common::schema::TableSchema;
use strata_common::types::TableId;

use crate::merge::MergeOutcome;
use crate::mvcc::TxnManager;
use crate::table::ColumnarTable;

pub struct StorageEngine {
    config: StorageConfig,
    txns: Arc<TxnManager>,
    tables: RwLock<HashMap<TableId, Arc<ColumnarTable>>>,
}

impl StorageEngine {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            txns: Arc::new(TxnManager::new()),
            tables: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn txn_manager(&self) -> &Arc<TxnManager> {
        &self.txns
    }

    pub fn create_table(&self, schema: TableSchema) -> Result<Arc<ColumnarTable>, StorageError> {
        let mut tables = self.tables.write();
        if tables.contains_key(&schema.id) || tables.values().any(|t| t.schema().name == schema.name) {
            return Err(StorageError::TableAlreadyExists(schema.name));
        }
        let id = schema.id;
        let name = schema.name.clone();
        let table = Arc::new(ColumnarTable::new(schema, self.config.clone(), Arc::clone(&self.txns)));
        tables.insert(id, Arc::clone(&table));
        tracing::info!("created columnar table {} ({})", name, id);
        Ok(table)
    }

    pub fn get_table(&self, id: TableId) -> Result<Arc<ColumnarTable>, StorageError> {
        self.tables
            .read()
            .get(&id)
            .cloned()
            .ok_or(StorageError::TableNotFound(id))
    }

    pub fn find_table(&self, name: &str) -> Option<Arc<ColumnarTable>> {
        self.tables
            .read()
            .values()
            .find(|t| t.schema().name == name)
            .cloned()
    }

    pub fn drop_table(&self, id: TableId) -> Result<(), StorageError> {
        let table = self
            .tables
            .write()
            .remove(&id)
            .ok_or(StorageError::TableNotFound(id))?;
        table.truncate();
        tracing::info!("dropped columnar table {} ({})", table.schema().name, id);
        Ok(())
    }

    pub fn table_ids(&self) -> Vec<TableId> {
        let mut ids: Vec<_> = self.tables.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Run one housekeeping pass over every table.
    pub fn housekeeping(&self) -> Vec<(TableId, Result<MergeOutcome, StorageError>)> {
        let tables: Vec<_> = self.tables.read().values().cloned().collect();
        let mut out: Vec<_> = tables
            .into_iter()
            .map(|t| (t.schema().id, t.housekeeping()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }
}
