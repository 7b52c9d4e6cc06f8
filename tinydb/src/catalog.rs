//! Persistent metadata: table and index descriptors plus the schema
//! version, bincode-serialized into a Catalog-tagged page chain rooted in
//! the database header. Autoincrement counters live in a sibling chain so
//! counter bumps do not rewrite the whole catalog.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tinydb_store::page::PageKind;
use tinydb_store::{Pager, NO_PAGE};

use crate::error::{Error, Result};
use crate::schema::{IndexDesc, TableDesc};

fn key_of(name: &str) -> String {
    name.to_ascii_lowercase()
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Catalog {
    /// Keyed by lowercased table name; descriptors keep the declared case.
    pub tables: BTreeMap<String, TableDesc>,
    pub indexes: BTreeMap<String, IndexDesc>,
    pub schema_version: u64,
}

impl Catalog {
    pub fn load(pager: &mut Pager) -> Result<Catalog> {
        let root = pager.catalog_root();
        if root == NO_PAGE {
            return Ok(Catalog::default());
        }
        let bytes = pager.read_chain(PageKind::Catalog, root)?;
        bincode::deserialize(&bytes)
            .map_err(|e| Error::Corruption(format!("catalog decode: {e}")))
    }

    /// Serializes into a fresh chain and swaps the header root. Every save
    /// is a DDL, so the schema version advances here.
    pub fn save(&mut self, pager: &mut Pager) -> Result<()> {
        self.schema_version += 1;
        let bytes = bincode::serialize(self)
            .map_err(|e| Error::Corruption(format!("catalog encode: {e}")))?;
        let old_root = pager.catalog_root();
        let new_root = pager.write_chain(PageKind::Catalog, &bytes)?;
        pager.set_catalog_root(new_root)?;
        if old_root != NO_PAGE {
            pager.free_chain(PageKind::Catalog, old_root)?;
        }
        Ok(())
    }

    pub fn contains_table(&self, name: &str) -> bool {
        self.tables.contains_key(&key_of(name))
    }

    pub fn table(&self, name: &str) -> Result<&TableDesc> {
        self.tables
            .get(&key_of(name))
            .ok_or_else(|| Error::NotFound(format!("table '{name}'")))
    }

    pub fn table_mut(&mut self, name: &str) -> Result<&mut TableDesc> {
        self.tables
            .get_mut(&key_of(name))
            .ok_or_else(|| Error::NotFound(format!("table '{name}'")))
    }

    pub fn add_table(&mut self, desc: TableDesc) -> Result<()> {
        let key = key_of(&desc.name);
        if self.tables.contains_key(&key) {
            return Err(Error::DuplicateName(format!("table '{}'", desc.name)));
        }
        self.tables.insert(key, desc);
        Ok(())
    }

    pub fn remove_table(&mut self, name: &str) -> Result<TableDesc> {
        self.tables
            .remove(&key_of(name))
            .ok_or_else(|| Error::NotFound(format!("table '{name}'")))
    }

    pub fn rename_table(&mut self, name: &str, new_name: &str) -> Result<()> {
        if self.contains_table(new_name) {
            return Err(Error::DuplicateName(format!("table '{new_name}'")));
        }
        let mut desc = self.remove_table(name)?;
        let old_name = desc.name.clone();
        desc.name = new_name.to_string();
        self.tables.insert(key_of(new_name), desc);

        // Keep dependent metadata coherent.
        for index in self.indexes.values_mut() {
            if index.table.eq_ignore_ascii_case(&old_name) {
                index.table = new_name.to_string();
            }
        }
        for table in self.tables.values_mut() {
            for column in &mut table.columns {
                if let Some(fk) = &mut column.references {
                    if fk.table.eq_ignore_ascii_case(&old_name) {
                        fk.table = new_name.to_string();
                    }
                }
            }
        }
        Ok(())
    }

    pub fn index(&self, name: &str) -> Result<&IndexDesc> {
        self.indexes
            .get(&key_of(name))
            .ok_or_else(|| Error::NotFound(format!("index '{name}'")))
    }

    pub fn add_index(&mut self, desc: IndexDesc) -> Result<()> {
        let key = key_of(&desc.name);
        if self.indexes.contains_key(&key) {
            return Err(Error::DuplicateName(format!("index '{}'", desc.name)));
        }
        self.indexes.insert(key, desc);
        Ok(())
    }

    pub fn remove_index(&mut self, name: &str) -> Result<IndexDesc> {
        self.indexes
            .remove(&key_of(name))
            .ok_or_else(|| Error::NotFound(format!("index '{name}'")))
    }

    pub fn indexes_for_table(&self, table: &str) -> Vec<IndexDesc> {
        self.indexes
            .values()
            .filter(|idx| idx.table.eq_ignore_ascii_case(table))
            .cloned()
            .collect()
    }

    /// Tables (and their FK columns) that reference `table`'s primary key.
    pub fn referencing_columns(&self, table: &str) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for desc in self.tables.values() {
            for column in &desc.columns {
                if let Some(fk) = &column.references {
                    if fk.table.eq_ignore_ascii_case(table) {
                        out.push((desc.name.clone(), column.name.clone()));
                    }
                }
            }
        }
        out
    }
}

/// Per-table autoincrement counters: the next value each table will hand
/// out. Counters only ever grow, deletes included.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AutoincCounters {
    counters: BTreeMap<String, i64>,
}

impl AutoincCounters {
    pub fn load(pager: &mut Pager) -> Result<AutoincCounters> {
        let root = pager.autoinc_root();
        if root == NO_PAGE {
            return Ok(AutoincCounters::default());
        }
        let bytes = pager.read_chain(PageKind::Catalog, root)?;
        bincode::deserialize(&bytes)
            .map_err(|e| Error::Corruption(format!("autoincrement decode: {e}")))
    }

    pub fn save(&self, pager: &mut Pager) -> Result<()> {
        let bytes = bincode::serialize(self)
            .map_err(|e| Error::Corruption(format!("autoincrement encode: {e}")))?;
        let old_root = pager.autoinc_root();
        let new_root = pager.write_chain(PageKind::Catalog, &bytes)?;
        pager.set_autoinc_root(new_root)?;
        if old_root != NO_PAGE {
            pager.free_chain(PageKind::Catalog, old_root)?;
        }
        Ok(())
    }

    pub fn next_value(&mut self, table: &str) -> i64 {
        let counter = self.counters.entry(key_of(table)).or_insert(1);
        let value = *counter;
        *counter += 1;
        value
    }

    /// An explicit value advances the counter so it never hands that value
    /// (or a smaller one) out later.
    pub fn observe(&mut self, table: &str, value: i64) {
        let counter = self.counters.entry(key_of(table)).or_insert(1);
        if value >= *counter {
            *counter = value + 1;
        }
    }

    pub fn remove(&mut self, table: &str) {
        self.counters.remove(&key_of(table));
    }

    pub fn rename(&mut self, table: &str, new_name: &str) {
        if let Some(counter) = self.counters.remove(&key_of(table)) {
            self.counters.insert(key_of(new_name), counter);
        }
    }
}
