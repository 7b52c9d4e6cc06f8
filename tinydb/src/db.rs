//! The database handle: the single-writer API the executor layer drives.
//!
//! Every mutating call runs inside a transaction. Without an explicit
//! `begin`, the statement is wrapped in its own begin/commit and any error
//! rolls it back; inside an explicit transaction, statements accumulate and
//! an error parks the transaction until `rollback`. Foreign-key checks are
//! queued and verified at commit, against the state being committed.

use std::path::Path;

use tinydb_store::Pager;

use crate::btree::BTree;
use crate::catalog::{AutoincCounters, Catalog};
use crate::error::{Error, Result};
use crate::key;
use crate::record;
use crate::schema::{AlterTableOp, ColumnDesc, IndexDesc, TableDesc};
use crate::tx::{PendingCheck, TxnManager, TxnStatus};
use crate::value::{coerce, Value};
use crate::tinydb_debug_log;

pub type Row = Vec<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
    Ok,
    /// An I/O failure aborted a transaction; reads still work, writes are
    /// refused until the database is reopened.
    ReadOnly,
    /// Corruption detected; nothing works anymore.
    Dead,
}

pub struct Database {
    pager: Pager,
    catalog: Catalog,
    autoinc: AutoincCounters,
    txn: TxnManager,
    health: Health,
    closed: bool,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Database> {
        let mut pager = Pager::open(path)?;
        let catalog = Catalog::load(&mut pager)?;
        let autoinc = AutoincCounters::load(&mut pager)?;
        Ok(Database {
            pager,
            catalog,
            autoinc,
            txn: TxnManager::default(),
            health: Health::Ok,
            closed: false,
        })
    }

    /// Rolls back anything in flight, checkpoints, and releases the handle.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        if self.health == Health::Ok {
            self.txn.finish();
            self.pager.close()?;
        }
        Ok(())
    }

    pub fn schema_version(&self) -> u64 {
        self.catalog.schema_version
    }

    // ---- transactions ----

    pub fn begin(&mut self) -> Result<()> {
        self.ensure_usable(true)?;
        self.txn.begin_explicit()?;
        if let Err(e) = self.pager.begin() {
            self.txn.finish();
            return Err(e.into());
        }
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.ensure_usable(true)?;
        if !self.txn.in_explicit() {
            return Err(Error::Busy);
        }
        self.txn.assert_writable()?;
        let result = self.commit_current();
        if let Err(e) = &result {
            self.record_failure(e);
        }
        result
    }

    pub fn rollback(&mut self) -> Result<()> {
        if self.health == Health::Dead {
            return Err(Error::Corruption("database handle is poisoned".into()));
        }
        if !self.txn.in_explicit() {
            return Err(Error::Busy);
        }
        self.rollback_current()
    }

    /// Walks every table and index B-tree verifying structural invariants
    /// (balanced depth, key ordering, separator bounds, minimum fill) and
    /// the free list.
    pub fn verify_integrity(&mut self) -> Result<()> {
        self.ensure_usable(false)?;
        let tables: Vec<TableDesc> = self.catalog.tables.values().cloned().collect();
        for desc in tables {
            BTree::open(desc.root_page).check(&mut self.pager)?;
        }
        let indexes: Vec<IndexDesc> = self.catalog.indexes.values().cloned().collect();
        for index in indexes {
            BTree::open(index.root_page).check(&mut self.pager)?;
        }
        self.pager.free_list()?;
        Ok(())
    }

    /// Flushes committed WAL state into the main file and truncates the log.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.ensure_usable(true)?;
        if self.txn.is_active() {
            return Err(Error::Busy);
        }
        self.pager.checkpoint().map_err(Into::into)
    }

    // ---- DDL ----

    pub fn create_table(&mut self, desc: TableDesc) -> Result<()> {
        self.run_statement(|db| db.create_table_inner(desc))
    }

    pub fn drop_table(&mut self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.run_statement(move |db| db.drop_table_inner(&name))
    }

    pub fn alter_table(&mut self, op: AlterTableOp) -> Result<()> {
        self.run_statement(move |db| db.alter_table_inner(op))
    }

    pub fn create_index(&mut self, desc: IndexDesc) -> Result<()> {
        self.run_statement(move |db| db.create_index_inner(desc))
    }

    pub fn drop_index(&mut self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.run_statement(move |db| db.drop_index_inner(&name))
    }

    // ---- DML ----

    pub fn insert(&mut self, table: &str, row: Row) -> Result<usize> {
        let table = table.to_string();
        self.run_statement(move |db| db.insert_inner(&table, row))
    }

    pub fn update(&mut self, table: &str, key_values: &[Value], row: Row) -> Result<usize> {
        let table = table.to_string();
        let key_values = key_values.to_vec();
        self.run_statement(move |db| db.update_inner(&table, &key_values, row))
    }

    pub fn delete(&mut self, table: &str, key_values: &[Value]) -> Result<usize> {
        let table = table.to_string();
        let key_values = key_values.to_vec();
        self.run_statement(move |db| db.delete_inner(&table, &key_values))
    }

    // ---- reads ----

    pub fn get(&mut self, table: &str, key_values: &[Value]) -> Result<Option<Row>> {
        self.ensure_usable(false)?;
        let desc = self.catalog.table(table)?.clone();
        let encoded = self.encode_pk_values(&desc, key_values)?;
        let tree = BTree::open(desc.root_page);
        match tree.find(&mut self.pager, &encoded)? {
            Some(payload) => Ok(Some(record::decode_row_with_schema(
                &payload,
                &desc.columns,
            )?)),
            None => Ok(None),
        }
    }

    /// Lazy ordered walk over a table, both bounds inclusive and optional.
    /// Dropping the iterator cancels the scan.
    pub fn scan(
        &mut self,
        table: &str,
        lo: Option<&[Value]>,
        hi: Option<&[Value]>,
        ascending: bool,
    ) -> Result<Scan<'_>> {
        self.ensure_usable(false)?;
        let desc = self.catalog.table(table)?.clone();
        let lo_key = match lo {
            Some(values) => Some(self.encode_pk_values(&desc, values)?),
            None => None,
        };
        let hi_key = match hi {
            Some(values) => Some(self.encode_pk_values(&desc, values)?),
            None => None,
        };
        let tree = BTree::open(desc.root_page);
        let inner = tree.range(
            &mut self.pager,
            lo_key.as_deref(),
            hi_key.as_deref(),
            ascending,
        )?;
        Ok(Scan {
            pager: &mut self.pager,
            inner,
            columns: desc.columns,
        })
    }

    // ---- statement plumbing ----

    fn ensure_usable(&self, writing: bool) -> Result<()> {
        match self.health {
            Health::Dead => Err(Error::Corruption("database handle is poisoned".into())),
            Health::ReadOnly if writing => Err(Error::Io(
                "handle is read-only after an i/o failure; reopen the database".into(),
            )),
            _ => Ok(()),
        }
    }

    fn record_failure(&mut self, err: &Error) {
        match err {
            Error::Corruption(_) => self.health = Health::Dead,
            Error::Io(_) => {
                if self.health == Health::Ok {
                    self.health = Health::ReadOnly;
                }
            }
            _ => {}
        }
    }

    fn run_statement<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.ensure_usable(true)?;
        self.txn.assert_writable()?;
        let explicit = self.txn.in_explicit();
        if !explicit {
            self.txn.begin_implicit()?;
            if let Err(e) = self.pager.begin() {
                self.txn.finish();
                return Err(e.into());
            }
        }

        match f(&mut *self) {
            Ok(value) => {
                if explicit {
                    return Ok(value);
                }
                match self.commit_current() {
                    Ok(()) => Ok(value),
                    Err(e) => {
                        if self.txn.status() != TxnStatus::Idle {
                            let _ = self.rollback_current();
                        }
                        self.record_failure(&e);
                        Err(e)
                    }
                }
            }
            Err(e) => {
                if explicit {
                    // Doomed until the caller issues ROLLBACK.
                    self.txn.mark_aborting();
                } else {
                    let _ = self.rollback_current();
                }
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    fn commit_current(&mut self) -> Result<()> {
        for check in self.txn.take_checks() {
            if let Err(e) = self.evaluate_check(&check) {
                self.txn.mark_aborting();
                return Err(e);
            }
        }
        self.txn.mark_committing()?;
        match self.pager.commit() {
            Ok(()) => {
                self.txn.finish();
                Ok(())
            }
            Err(e) => {
                // The staged transaction is gone; resync in-memory metadata
                // with whatever is durable.
                self.txn.finish();
                self.reload_metadata();
                Err(e.into())
            }
        }
    }

    fn rollback_current(&mut self) -> Result<()> {
        let result = self.pager.rollback();
        self.txn.finish();
        self.reload_metadata();
        result.map_err(Into::into)
    }

    fn reload_metadata(&mut self) {
        match Catalog::load(&mut self.pager) {
            Ok(catalog) => self.catalog = catalog,
            Err(e) => {
                tinydb_debug_log!("[Database] catalog reload failed: {e}");
                self.health = Health::Dead;
            }
        }
        match AutoincCounters::load(&mut self.pager) {
            Ok(autoinc) => self.autoinc = autoinc,
            Err(e) => {
                tinydb_debug_log!("[Database] autoincrement reload failed: {e}");
                self.health = Health::Dead;
            }
        }
    }

    // ---- DDL internals ----

    fn create_table_inner(&mut self, mut desc: TableDesc) -> Result<()> {
        desc.normalize()?;
        if self.catalog.contains_table(&desc.name) {
            return Err(Error::DuplicateName(format!("table '{}'", desc.name)));
        }
        for column in &desc.columns {
            if let Some(fk) = &column.references {
                let parent = self.catalog.table(&fk.table).map_err(|_| {
                    Error::Schema(format!(
                        "foreign key on '{}' references unknown table '{}'",
                        column.name, fk.table
                    ))
                })?;
                if parent.primary_key.len() != 1
                    || !parent.primary_key[0].eq_ignore_ascii_case(&fk.column)
                {
                    return Err(Error::Schema(format!(
                        "foreign key on '{}' must reference the primary key of '{}'",
                        column.name, parent.name
                    )));
                }
                let target = parent.column(&fk.column).ok_or_else(|| {
                    Error::Schema(format!(
                        "referenced column '{}.{}' does not exist",
                        fk.table, fk.column
                    ))
                })?;
                if target.ty != column.ty {
                    return Err(Error::Schema(format!(
                        "foreign key '{}' type {} does not match '{}.{}' type {}",
                        column.name, column.ty, parent.name, fk.column, target.ty
                    )));
                }
            }
        }

        let tree = BTree::create(&mut self.pager)?;
        desc.root_page = tree.root;
        let has_autoinc = desc.autoincrement_position().is_some();
        let name = desc.name.clone();
        self.catalog.add_table(desc)?;
        self.catalog.save(&mut self.pager)?;
        if has_autoinc {
            self.autoinc.observe(&name, 0);
            self.autoinc.save(&mut self.pager)?;
        }
        Ok(())
    }

    fn drop_table_inner(&mut self, name: &str) -> Result<()> {
        let desc = self.catalog.table(name)?.clone();
        for (child_table, child_column) in self.catalog.referencing_columns(&desc.name) {
            if !child_table.eq_ignore_ascii_case(&desc.name) {
                return Err(Error::Schema(format!(
                    "table '{}' is referenced by {child_table}.{child_column}",
                    desc.name
                )));
            }
        }
        for index in self.catalog.indexes_for_table(&desc.name) {
            BTree::open(index.root_page).free(&mut self.pager)?;
            self.catalog.remove_index(&index.name)?;
        }
        BTree::open(desc.root_page).free(&mut self.pager)?;
        self.catalog.remove_table(name)?;
        self.autoinc.remove(&desc.name);
        self.catalog.save(&mut self.pager)?;
        self.autoinc.save(&mut self.pager)?;
        Ok(())
    }

    fn alter_table_inner(&mut self, op: AlterTableOp) -> Result<()> {
        match op {
            AlterTableOp::RenameTable { table, new_name } => {
                self.catalog.table(&table)?;
                self.catalog.rename_table(&table, &new_name)?;
                self.autoinc.rename(&table, &new_name);
                self.catalog.save(&mut self.pager)?;
                self.autoinc.save(&mut self.pager)?;
            }
            AlterTableOp::RenameColumn {
                table,
                column,
                new_name,
            } => {
                let desc = self.catalog.table_mut(&table)?;
                let idx = desc.column_index(&column).ok_or_else(|| {
                    Error::NotFound(format!("column '{column}' in table '{table}'"))
                })?;
                if desc.column_index(&new_name).is_some() {
                    return Err(Error::Schema(format!("column '{new_name}' already exists")));
                }
                let old_name = desc.columns[idx].name.clone();
                desc.columns[idx].name = new_name.clone();
                for pk_name in &mut desc.primary_key {
                    if pk_name.eq_ignore_ascii_case(&old_name) {
                        *pk_name = new_name.clone();
                    }
                }
                let table_name = desc.name.clone();
                for index in self.catalog.indexes.values_mut() {
                    if index.table.eq_ignore_ascii_case(&table_name) {
                        for col in &mut index.columns {
                            if col.eq_ignore_ascii_case(&old_name) {
                                *col = new_name.clone();
                            }
                        }
                    }
                }
                for other in self.catalog.tables.values_mut() {
                    for col in &mut other.columns {
                        if let Some(fk) = &mut col.references {
                            if fk.table.eq_ignore_ascii_case(&table_name)
                                && fk.column.eq_ignore_ascii_case(&old_name)
                            {
                                fk.column = new_name.clone();
                            }
                        }
                    }
                }
                self.catalog.save(&mut self.pager)?;
            }
            AlterTableOp::AddColumn { table, column } => {
                self.add_column_inner(&table, column)?;
            }
            AlterTableOp::RemoveColumn { table, column } => {
                self.remove_column_inner(&table, &column)?;
            }
        }
        Ok(())
    }

    /// New columns must be nullable non-key columns; existing rows read the
    /// column's default (NULL when none) via decode-time backfill.
    fn add_column_inner(&mut self, table: &str, mut column: ColumnDesc) -> Result<()> {
        if column.primary_key {
            return Err(Error::Schema(
                "ADD COLUMN cannot add a PRIMARY KEY column".into(),
            ));
        }
        if !column.nullable {
            return Err(Error::Schema(
                "ADD COLUMN requires a nullable column".into(),
            ));
        }
        if column.autoincrement {
            return Err(Error::Schema(
                "ADD COLUMN cannot add an AUTOINCREMENT column".into(),
            ));
        }
        if let Some(fk) = &column.references {
            let parent = self.catalog.table(&fk.table).map_err(|_| {
                Error::Schema(format!(
                    "foreign key on '{}' references unknown table '{}'",
                    column.name, fk.table
                ))
            })?;
            if parent.primary_key.len() != 1
                || !parent.primary_key[0].eq_ignore_ascii_case(&fk.column)
            {
                return Err(Error::Schema(format!(
                    "foreign key on '{}' must reference the primary key of '{}'",
                    column.name, parent.name
                )));
            }
        }
        if let Some(default) = column.default.take() {
            let coerced = coerce(default, column.ty).map_err(|_| {
                Error::Schema(format!(
                    "default value for column '{}' does not fit type {}",
                    column.name, column.ty
                ))
            })?;
            column.default = Some(coerced);
        }

        let desc = self.catalog.table_mut(table)?;
        if desc.column_index(&column.name).is_some() {
            return Err(Error::Schema(format!(
                "column '{}' already exists",
                column.name
            )));
        }
        desc.columns.push(column);
        self.catalog.save(&mut self.pager)?;
        Ok(())
    }

    /// Only the trailing non-key column can go: stored rows simply decode
    /// one value short, no rewrite.
    fn remove_column_inner(&mut self, table: &str, column: &str) -> Result<()> {
        let table_name = self.catalog.table(table)?.name.clone();
        for index in self.catalog.indexes_for_table(&table_name) {
            if index.columns.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                return Err(Error::Schema(format!(
                    "column '{column}' is used by index '{}'",
                    index.name
                )));
            }
        }
        let desc = self.catalog.table_mut(table)?;
        let idx = desc
            .column_index(column)
            .ok_or_else(|| Error::NotFound(format!("column '{column}' in table '{table}'")))?;
        if desc.columns.len() == 1 {
            return Err(Error::Schema("cannot remove the only column".into()));
        }
        if desc.columns[idx].primary_key {
            return Err(Error::Schema("cannot remove a PRIMARY KEY column".into()));
        }
        if idx != desc.columns.len() - 1 {
            return Err(Error::Schema(
                "REMOVE COLUMN supports only the last column".into(),
            ));
        }
        desc.columns.pop();
        self.catalog.save(&mut self.pager)?;
        Ok(())
    }

    fn create_index_inner(&mut self, mut desc: IndexDesc) -> Result<()> {
        if self.catalog.indexes.contains_key(&desc.name.to_ascii_lowercase()) {
            return Err(Error::DuplicateName(format!("index '{}'", desc.name)));
        }
        let table = self.catalog.table(&desc.table)?.clone();
        if desc.columns.is_empty() {
            return Err(Error::Schema("an index needs at least one column".into()));
        }
        let mut normalized = Vec::with_capacity(desc.columns.len());
        for name in &desc.columns {
            let idx = table.column_index(name).ok_or_else(|| {
                Error::Schema(format!(
                    "index column '{name}' does not exist in table '{}'",
                    table.name
                ))
            })?;
            let canonical = table.columns[idx].name.clone();
            if normalized.iter().any(|c: &String| c.eq_ignore_ascii_case(&canonical)) {
                return Err(Error::Schema(format!(
                    "column '{canonical}' listed twice in the index"
                )));
            }
            normalized.push(canonical);
        }
        desc.columns = normalized;
        desc.table = table.name.clone();

        let tree = BTree::create(&mut self.pager)?;
        desc.root_page = tree.root;

        // Backfill from existing rows.
        let rows = self.scan_all_rows(&table)?;
        for row in &rows {
            let pk_key = self.pk_key_from_row(&table, row)?;
            if let Some(index_key) = index_key_for(&desc, &table, row, &pk_key)? {
                tree.insert(&mut self.pager, &index_key, &pk_key)
                    .map_err(|e| match e {
                        Error::DuplicateKey(_) => Error::DuplicateKey(format!(
                            "UNIQUE index '{}' over existing rows",
                            desc.name
                        )),
                        other => other,
                    })?;
            }
        }

        self.catalog.add_index(desc)?;
        self.catalog.save(&mut self.pager)?;
        Ok(())
    }

    fn drop_index_inner(&mut self, name: &str) -> Result<()> {
        let desc = self.catalog.index(name)?.clone();
        BTree::open(desc.root_page).free(&mut self.pager)?;
        self.catalog.remove_index(name)?;
        self.catalog.save(&mut self.pager)?;
        Ok(())
    }

    // ---- DML internals ----

    fn insert_inner(&mut self, table: &str, row: Row) -> Result<usize> {
        let desc = self.catalog.table(table)?.clone();
        let mut values = self.prepare_row(&desc, row)?;

        if let Some(pos) = desc.autoincrement_position() {
            match &values[pos] {
                Value::Null => {
                    let assigned = self.autoinc.next_value(&desc.name);
                    values[pos] = Value::Integer(assigned);
                }
                Value::Integer(v) => self.autoinc.observe(&desc.name, *v),
                _ => {}
            }
            self.autoinc.save(&mut self.pager)?;
        }
        check_not_null(&desc, &values)?;

        let pk_key = self.pk_key_from_row(&desc, &values)?;
        self.check_unique_columns(&desc, &values, None)?;

        let tree = BTree::open(desc.root_page);
        tree.insert(&mut self.pager, &pk_key, &record::encode_row(&values))
            .map_err(|e| match e {
                Error::DuplicateKey(_) => {
                    Error::DuplicateKey(format!("primary key in table '{}'", desc.name))
                }
                other => other,
            })?;

        for index in self.catalog.indexes_for_table(&desc.name) {
            if let Some(index_key) = index_key_for(&index, &desc, &values, &pk_key)? {
                BTree::open(index.root_page)
                    .insert(&mut self.pager, &index_key, &pk_key)
                    .map_err(|e| match e {
                        Error::DuplicateKey(_) => {
                            Error::DuplicateKey(format!("UNIQUE index '{}'", index.name))
                        }
                        other => other,
                    })?;
            }
        }

        self.queue_fk_checks(&desc, &values);
        Ok(1)
    }

    fn update_inner(&mut self, table: &str, key_values: &[Value], row: Row) -> Result<usize> {
        let desc = self.catalog.table(table)?.clone();
        let old_key = self.encode_pk_values(&desc, key_values)?;
        let tree = BTree::open(desc.root_page);
        let old_payload = tree
            .find(&mut self.pager, &old_key)?
            .ok_or_else(|| Error::NotFound(format!("no row with that key in '{}'", desc.name)))?;
        let old_values = record::decode_row_with_schema(&old_payload, &desc.columns)?;

        let mut new_values = self.prepare_row(&desc, row)?;
        if let Some(pos) = desc.autoincrement_position() {
            if let Value::Integer(v) = &new_values[pos] {
                self.autoinc.observe(&desc.name, *v);
                self.autoinc.save(&mut self.pager)?;
            }
            if new_values[pos].is_null() {
                return Err(Error::Constraint(format!(
                    "column '{}' cannot be NULL",
                    desc.columns[pos].name
                )));
            }
        }
        check_not_null(&desc, &new_values)?;

        let new_key = self.pk_key_from_row(&desc, &new_values)?;
        let key_changed = key::compare_encoded(&old_key, &new_key)? != std::cmp::Ordering::Equal;
        if key_changed && tree.find(&mut self.pager, &new_key)?.is_some() {
            return Err(Error::DuplicateKey(format!(
                "primary key in table '{}'",
                desc.name
            )));
        }
        self.check_unique_columns(&desc, &new_values, Some(&old_key))?;

        // Index entries move before the row does.
        for index in self.catalog.indexes_for_table(&desc.name) {
            let index_tree = BTree::open(index.root_page);
            if let Some(old_entry) = index_key_for(&index, &desc, &old_values, &old_key)? {
                index_tree.delete(&mut self.pager, &old_entry)?;
            }
            if let Some(new_entry) = index_key_for(&index, &desc, &new_values, &new_key)? {
                index_tree
                    .insert(&mut self.pager, &new_entry, &new_key)
                    .map_err(|e| match e {
                        Error::DuplicateKey(_) => {
                            Error::DuplicateKey(format!("UNIQUE index '{}'", index.name))
                        }
                        other => other,
                    })?;
            }
        }

        let payload = record::encode_row(&new_values);
        if key_changed {
            tree.delete(&mut self.pager, &old_key)?;
            tree.insert(&mut self.pager, &new_key, &payload)?;
            // The old key vanished; nothing may still point at it.
            self.txn.queue_check(PendingCheck::NoReferents {
                parent_table: desc.name.clone(),
                key: key_values.to_vec(),
            });
        } else {
            tree.update(&mut self.pager, &old_key, &payload)?;
        }

        self.queue_fk_checks(&desc, &new_values);
        Ok(1)
    }

    fn delete_inner(&mut self, table: &str, key_values: &[Value]) -> Result<usize> {
        let desc = self.catalog.table(table)?.clone();
        let encoded = self.encode_pk_values(&desc, key_values)?;
        let tree = BTree::open(desc.root_page);
        let payload = tree
            .find(&mut self.pager, &encoded)?
            .ok_or_else(|| Error::NotFound(format!("no row with that key in '{}'", desc.name)))?;
        let values = record::decode_row_with_schema(&payload, &desc.columns)?;

        tree.delete(&mut self.pager, &encoded)?;
        for index in self.catalog.indexes_for_table(&desc.name) {
            if let Some(entry) = index_key_for(&index, &desc, &values, &encoded)? {
                BTree::open(index.root_page).delete(&mut self.pager, &entry)?;
            }
        }

        self.txn.queue_check(PendingCheck::NoReferents {
            parent_table: desc.name.clone(),
            key: key_values.to_vec(),
        });
        Ok(1)
    }

    // ---- row and key plumbing ----

    /// Arity check, defaults for NULL slots, per-column coercion. NOT NULL
    /// is checked separately, after autoincrement assignment.
    fn prepare_row(&self, desc: &TableDesc, row: Row) -> Result<Vec<Value>> {
        if row.len() != desc.columns.len() {
            return Err(Error::Constraint(format!(
                "table '{}' has {} columns, row has {}",
                desc.name,
                desc.columns.len(),
                row.len()
            )));
        }
        let mut out = Vec::with_capacity(row.len());
        for (column, value) in desc.columns.iter().zip(row) {
            let value = if value.is_null() && !column.autoincrement {
                match &column.default {
                    Some(default) => default.clone(),
                    None => Value::Null,
                }
            } else {
                value
            };
            let coerced = coerce(value, column.ty).map_err(|e| match e {
                Error::Constraint(msg) => {
                    Error::Constraint(format!("column '{}': {msg}", column.name))
                }
                other => other,
            })?;
            out.push(coerced);
        }
        Ok(out)
    }

    fn encode_pk_values(&self, desc: &TableDesc, key_values: &[Value]) -> Result<Vec<u8>> {
        let positions = desc.pk_positions();
        if key_values.len() != positions.len() {
            return Err(Error::Constraint(format!(
                "primary key of '{}' has {} columns, got {}",
                desc.name,
                positions.len(),
                key_values.len()
            )));
        }
        let mut coerced = Vec::with_capacity(key_values.len());
        for (value, pos) in key_values.iter().zip(positions) {
            if value.is_null() {
                return Err(Error::Constraint("PRIMARY KEY cannot be NULL".into()));
            }
            coerced.push(coerce(value.clone(), desc.columns[pos].ty)?);
        }
        Ok(key::encode_key(&coerced))
    }

    fn pk_key_from_row(&self, desc: &TableDesc, values: &[Value]) -> Result<Vec<u8>> {
        let mut parts = Vec::new();
        for pos in desc.pk_positions() {
            if values[pos].is_null() {
                return Err(Error::Constraint("PRIMARY KEY cannot be NULL".into()));
            }
            parts.push(values[pos].clone());
        }
        Ok(key::encode_key(&parts))
    }

    fn scan_all_rows(&mut self, desc: &TableDesc) -> Result<Vec<Row>> {
        let tree = BTree::open(desc.root_page);
        let mut scan = tree.range(&mut self.pager, None, None, true)?;
        let mut rows = Vec::new();
        while let Some((_, payload)) = scan.next_entry(&mut self.pager)? {
            rows.push(record::decode_row_with_schema(&payload, &desc.columns)?);
        }
        Ok(rows)
    }

    /// UNIQUE column enforcement; `skip_key` excludes the row being updated.
    fn check_unique_columns(
        &mut self,
        desc: &TableDesc,
        values: &[Value],
        skip_key: Option<&[u8]>,
    ) -> Result<()> {
        let unique_positions: Vec<usize> = desc
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.unique && !c.primary_key)
            .map(|(i, _)| i)
            .collect();
        if unique_positions.is_empty() {
            return Ok(());
        }

        for existing in self.scan_all_rows(desc)? {
            if let Some(skip) = skip_key {
                let existing_key = self.pk_key_from_row(desc, &existing)?;
                if key::compare_encoded(&existing_key, skip)? == std::cmp::Ordering::Equal {
                    continue;
                }
            }
            for &pos in &unique_positions {
                if values[pos].is_null() {
                    continue;
                }
                if key::compare_values(&existing[pos], &values[pos])
                    == std::cmp::Ordering::Equal
                {
                    return Err(Error::DuplicateKey(format!(
                        "UNIQUE column '{}.{}'",
                        desc.name, desc.columns[pos].name
                    )));
                }
            }
        }
        Ok(())
    }

    fn queue_fk_checks(&mut self, desc: &TableDesc, values: &[Value]) {
        for (i, column) in desc.columns.iter().enumerate() {
            if let Some(fk) = &column.references {
                if !values[i].is_null() {
                    self.txn.queue_check(PendingCheck::ParentExists {
                        child_table: desc.name.clone(),
                        column: column.name.clone(),
                        parent_table: fk.table.clone(),
                        key: vec![values[i].clone()],
                    });
                }
            }
        }
    }

    /// Verifies one deferred referential check against the state being
    /// committed.
    fn evaluate_check(&mut self, check: &PendingCheck) -> Result<()> {
        match check {
            PendingCheck::ParentExists {
                child_table,
                column,
                parent_table,
                key: key_values,
            } => {
                let parent = self
                    .catalog
                    .table(parent_table)
                    .map_err(|_| {
                        Error::Constraint(format!(
                            "{child_table}.{column} references dropped table '{parent_table}'"
                        ))
                    })?
                    .clone();
                let encoded = self.encode_pk_values(&parent, key_values)?;
                if BTree::open(parent.root_page)
                    .find(&mut self.pager, &encoded)?
                    .is_none()
                {
                    return Err(Error::Constraint(format!(
                        "FOREIGN KEY: {child_table}.{column} references a missing '{parent_table}' key"
                    )));
                }
                Ok(())
            }
            PendingCheck::NoReferents {
                parent_table,
                key: key_values,
            } => {
                let Ok(parent) = self.catalog.table(parent_table).map(Clone::clone) else {
                    // Table dropped later in the transaction; the drop did
                    // its own referent validation.
                    return Ok(());
                };
                let encoded = self.encode_pk_values(&parent, key_values)?;
                if BTree::open(parent.root_page)
                    .find(&mut self.pager, &encoded)?
                    .is_some()
                {
                    // The key exists again; nothing dangles.
                    return Ok(());
                }
                for (child_table, child_column) in
                    self.catalog.referencing_columns(&parent.name)
                {
                    let child = self.catalog.table(&child_table)?.clone();
                    let Some(pos) = child.column_index(&child_column) else {
                        continue;
                    };
                    for row in self.scan_all_rows(&child)? {
                        if key::compare_values(&row[pos], &key_values[0])
                            == std::cmp::Ordering::Equal
                        {
                            return Err(Error::Constraint(format!(
                                "row is referenced by {child_table}.{child_column}"
                            )));
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

fn check_not_null(desc: &TableDesc, values: &[Value]) -> Result<()> {
    for (column, value) in desc.columns.iter().zip(values) {
        if !column.nullable && value.is_null() {
            return Err(Error::Constraint(format!(
                "column '{}' cannot be NULL",
                column.name
            )));
        }
    }
    Ok(())
}

/// Key for one index entry: the indexed columns, with the primary key
/// appended on non-unique indexes so duplicates stay distinct. Rows with a
/// NULL in any indexed column are not indexed.
fn index_key_for(
    index: &IndexDesc,
    desc: &TableDesc,
    values: &[Value],
    pk_key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let mut parts = Vec::with_capacity(index.columns.len() + 1);
    for name in &index.columns {
        let pos = desc
            .column_index(name)
            .ok_or_else(|| Error::Corruption(format!("index column '{name}' missing")))?;
        if values[pos].is_null() {
            return Ok(None);
        }
        parts.push(values[pos].clone());
    }
    if index.unique {
        return Ok(Some(key::encode_key(&parts)));
    }
    let mut pk_values = key::decode_key(pk_key)?;
    parts.append(&mut pk_values);
    Ok(Some(key::encode_key(&parts)))
}

/// Lazy row iterator over a primary-key range.
pub struct Scan<'p> {
    pager: &'p mut Pager,
    inner: crate::btree::RangeScan,
    columns: Vec<ColumnDesc>,
}

impl Iterator for Scan<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next_entry(self.pager) {
            Ok(Some((_, payload))) => {
                Some(record::decode_row_with_schema(&payload, &self.columns))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.closed && self.health == Health::Ok {
            let _ = self.pager.close();
        }
    }
}
