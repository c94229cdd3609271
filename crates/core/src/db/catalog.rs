//! The system catalog: authoritative, name-keyed metadata for tables,
//! indexes, views, triggers and statistics.
//!
//! The catalog lives in memory and is mirrored into a dedicated catalog
//! B-tree so a database file can be reopened. Entries serialize as ordinary
//! codec rows, keyed `table:<name>`, `index:<name>`, `view:<name>`,
//! `trigger:<seq>:<name>`.

use crate::db::schema::{
    ColumnConstraint, ColumnSchema, ColumnType, FkAction, ForeignKey, HnswParams, IndexDef, IndexKind,
    TableConstraint, TableSchema, TriggerDef, ViewDef,
};
use crate::db::stats::TableStats;
use crate::error::{DBError, TableError};
use micadb_types::{Row, Value};
use std::collections::BTreeMap;

/// Manage the database metadata.
#[derive(Default)]
pub struct Catalog {
    tables: BTreeMap<String, TableSchema>,
    indexes: BTreeMap<String, IndexDef>,
    views: BTreeMap<String, ViewDef>,
    /// Creation-ordered; trigger firing order follows this.
    triggers: Vec<TriggerDef>,
    stats: BTreeMap<String, TableStats>,
}

fn key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(&key(name))
    }

    pub fn table_mut(&mut self, name: &str) -> Option<&mut TableSchema> {
        self.tables.get_mut(&key(name))
    }

    pub fn require_table(&self, name: &str) -> Result<&TableSchema, DBError> {
        self.table(name)
            .ok_or_else(|| TableError::NotFound(name.to_string()).into())
    }

    pub fn insert_table(&mut self, schema: TableSchema) {
        self.tables.insert(key(&schema.name), schema);
    }

    pub fn remove_table(&mut self, name: &str) -> Option<TableSchema> {
        self.stats.remove(&key(name));
        self.tables.remove(&key(name))
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.get(&key(name))
    }

    pub fn insert_index(&mut self, def: IndexDef) {
        self.indexes.insert(key(&def.name), def);
    }

    pub fn remove_index(&mut self, name: &str) -> Option<IndexDef> {
        self.indexes.remove(&key(name))
    }

    pub fn indexes(&self) -> impl Iterator<Item = &IndexDef> {
        self.indexes.values()
    }

    pub fn indexes_for_table(&self, table: &str) -> Vec<IndexDef> {
        self.indexes
            .values()
            .filter(|i| i.table.eq_ignore_ascii_case(table))
            .cloned()
            .collect()
    }

    pub fn view(&self, name: &str) -> Option<&ViewDef> {
        self.views.get(&key(name))
    }

    pub fn insert_view(&mut self, def: ViewDef) {
        self.views.insert(key(&def.name), def);
    }

    pub fn remove_view(&mut self, name: &str) -> Option<ViewDef> {
        self.views.remove(&key(name))
    }

    pub fn trigger(&self, name: &str) -> Option<&TriggerDef> {
        self.triggers.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn insert_trigger(&mut self, def: TriggerDef) {
        self.triggers.push(def);
    }

    pub fn remove_trigger(&mut self, name: &str) -> Option<TriggerDef> {
        let at = self.triggers.iter().position(|t| t.name.eq_ignore_ascii_case(name))?;
        Some(self.triggers.remove(at))
    }

    pub fn triggers(&self) -> &[TriggerDef] {
        &self.triggers
    }

    pub fn drop_triggers_for_table(&mut self, table: &str) {
        self.triggers.retain(|t| !t.table.eq_ignore_ascii_case(table));
    }

    pub fn stats(&self, table: &str) -> Option<&TableStats> {
        self.stats.get(&key(table))
    }

    pub fn stats_mut(&mut self, table: &str) -> Option<&mut TableStats> {
        self.stats.get_mut(&key(table))
    }

    pub fn set_stats(&mut self, table: &str, stats: TableStats) {
        self.stats.insert(key(table), stats);
    }

    /// All durable entries, as `(tree key, row)` pairs.
    pub fn to_rows(&self) -> Vec<(String, Row)> {
        let mut out = Vec::new();
        for table in self.tables.values() {
            out.push((format!("table:{}", key(&table.name)), encode_table(table)));
        }
        for index in self.indexes.values() {
            out.push((format!("index:{}", key(&index.name)), encode_index(index)));
        }
        for view in self.views.values() {
            out.push((format!("view:{}", key(&view.name)), encode_view(view)));
        }
        for (seq, trigger) in self.triggers.iter().enumerate() {
            out.push((
                format!("trigger:{seq:06}:{}", key(&trigger.name)),
                vec![Value::text(trigger.name.clone()), Value::text(trigger.sql.clone())],
            ));
        }
        out
    }

    /// Rebuild a catalog from stored `(tree key, row)` pairs. Trigger rows
    /// carry their CREATE TRIGGER text and are re-parsed by the caller.
    pub fn from_rows(rows: Vec<(String, Row)>) -> Result<(Catalog, Vec<String>), DBError> {
        let mut catalog = Catalog::new();
        let mut trigger_sql = Vec::new();
        for (k, row) in rows {
            let Some((kind, _)) = k.split_once(':') else {
                return Err(corrupt(&format!("bad catalog key `{k}`")));
            };
            match kind {
                "table" => catalog.insert_table(decode_table(&row)?),
                "index" => catalog.insert_index(decode_index(&row)?),
                "view" => catalog.insert_view(decode_view(&row)?),
                "trigger" => {
                    let mut r = RowReader::new(&row);
                    let _name = r.text()?;
                    trigger_sql.push(r.text()?);
                }
                _ => return Err(corrupt(&format!("bad catalog key `{k}`"))),
            }
        }
        Ok((catalog, trigger_sql))
    }
}

fn corrupt(msg: &str) -> DBError {
    DBError::Storage(micadb_storage::StorageError::Corrupt(msg.to_string()))
}

// Catalog entries are plain codec rows; a small reader/writer pair keeps the
// field order in one place.

struct RowReader<'a> {
    row: &'a [Value],
    pos: usize,
}

impl<'a> RowReader<'a> {
    fn new(row: &'a [Value]) -> Self {
        RowReader { row, pos: 0 }
    }

    fn next(&mut self) -> Result<&'a Value, DBError> {
        let v = self.row.get(self.pos).ok_or_else(|| corrupt("short catalog row"))?;
        self.pos += 1;
        Ok(v)
    }

    fn text(&mut self) -> Result<String, DBError> {
        match self.next()? {
            Value::Text { v, .. } => Ok(v.clone()),
            other => Err(corrupt(&format!("expected text, got {}", other.type_name()))),
        }
    }

    fn opt_text(&mut self) -> Result<Option<String>, DBError> {
        match self.next()? {
            Value::Null => Ok(None),
            Value::Text { v, .. } => Ok(Some(v.clone())),
            other => Err(corrupt(&format!("expected text, got {}", other.type_name()))),
        }
    }

    fn int(&mut self) -> Result<i64, DBError> {
        self.next()?
            .as_int()
            .ok_or_else(|| corrupt("expected integer in catalog row"))
    }
}

fn encode_table(t: &TableSchema) -> Row {
    let mut row = vec![
        Value::text(t.name.clone()),
        Value::int(t.root_page as i64),
        Value::int(t.next_rowid as i64),
        Value::int(t.max_integer_pk),
        Value::int(t.columns.len() as i64),
    ];
    for col in &t.columns {
        row.push(Value::text(col.name.clone()));
        row.push(Value::text(col.ty.to_string()));
        row.push(Value::int(col.serial as i64));
        row.push(Value::int(col.constraints.len() as i64));
        for c in &col.constraints {
            encode_column_constraint(&mut row, c);
        }
    }
    row.push(Value::int(t.constraints.len() as i64));
    for c in &t.constraints {
        encode_table_constraint(&mut row, c);
    }
    row
}

fn encode_column_constraint(row: &mut Row, c: &ColumnConstraint) {
    match c {
        ColumnConstraint::PrimaryKey => row.push(Value::text("PK")),
        ColumnConstraint::NotNull => row.push(Value::text("NOTNULL")),
        ColumnConstraint::Unique => row.push(Value::text("UNIQUE")),
        ColumnConstraint::Check(sql) => {
            row.push(Value::text("CHECK"));
            row.push(Value::text(sql.clone()));
        }
        ColumnConstraint::Default(sql) => {
            row.push(Value::text("DEFAULT"));
            row.push(Value::text(sql.clone()));
        }
        ColumnConstraint::ForeignKey(fk) => {
            row.push(Value::text("FK"));
            row.push(Value::text(fk.table.clone()));
            row.push(Value::text(fk.column.clone()));
            row.push(Value::text(fk.on_delete.to_string()));
            row.push(Value::text(fk.on_update.to_string()));
        }
    }
}

fn decode_column_constraint(r: &mut RowReader) -> Result<ColumnConstraint, DBError> {
    let tag = r.text()?;
    Ok(match tag.as_str() {
        "PK" => ColumnConstraint::PrimaryKey,
        "NOTNULL" => ColumnConstraint::NotNull,
        "UNIQUE" => ColumnConstraint::Unique,
        "CHECK" => ColumnConstraint::Check(r.text()?),
        "DEFAULT" => ColumnConstraint::Default(r.text()?),
        "FK" => ColumnConstraint::ForeignKey(decode_fk(r)?),
        _ => return Err(corrupt(&format!("bad column constraint tag `{tag}`"))),
    })
}

fn decode_fk(r: &mut RowReader) -> Result<ForeignKey, DBError> {
    let table = r.text()?;
    let column = r.text()?;
    let on_delete = FkAction::parse(&r.text()?).ok_or_else(|| corrupt("bad FK action"))?;
    let on_update = FkAction::parse(&r.text()?).ok_or_else(|| corrupt("bad FK action"))?;
    Ok(ForeignKey {
        table,
        column,
        on_delete,
        on_update,
    })
}

fn encode_table_constraint(row: &mut Row, c: &TableConstraint) {
    match c {
        TableConstraint::PrimaryKey(cols) => {
            row.push(Value::text("PK"));
            encode_names(row, cols);
        }
        TableConstraint::Unique(cols) => {
            row.push(Value::text("UNIQUE"));
            encode_names(row, cols);
        }
        TableConstraint::Check(sql) => {
            row.push(Value::text("CHECK"));
            row.push(Value::text(sql.clone()));
        }
        TableConstraint::ForeignKey { columns, fk } => {
            row.push(Value::text("FK"));
            encode_names(row, columns);
            row.push(Value::text(fk.table.clone()));
            row.push(Value::text(fk.column.clone()));
            row.push(Value::text(fk.on_delete.to_string()));
            row.push(Value::text(fk.on_update.to_string()));
        }
    }
}

fn decode_table_constraint(r: &mut RowReader) -> Result<TableConstraint, DBError> {
    let tag = r.text()?;
    Ok(match tag.as_str() {
        "PK" => TableConstraint::PrimaryKey(decode_names(r)?),
        "UNIQUE" => TableConstraint::Unique(decode_names(r)?),
        "CHECK" => TableConstraint::Check(r.text()?),
        "FK" => {
            let columns = decode_names(r)?;
            let fk = decode_fk(r)?;
            TableConstraint::ForeignKey { columns, fk }
        }
        _ => return Err(corrupt(&format!("bad table constraint tag `{tag}`"))),
    })
}

fn encode_names(row: &mut Row, names: &[String]) {
    row.push(Value::int(names.len() as i64));
    for n in names {
        row.push(Value::text(n.clone()));
    }
}

fn decode_names(r: &mut RowReader) -> Result<Vec<String>, DBError> {
    let n = r.int()? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(r.text()?);
    }
    Ok(out)
}

fn decode_table(row: &Row) -> Result<TableSchema, DBError> {
    let mut r = RowReader::new(row);
    let name = r.text()?;
    let root_page = r.int()? as u32;
    let next_rowid = r.int()? as u64;
    let max_integer_pk = r.int()?;
    let ncols = r.int()? as usize;
    let mut columns = Vec::with_capacity(ncols);
    for _ in 0..ncols {
        let col_name = r.text()?;
        let ty_text = r.text()?;
        let ty = ColumnType::parse(&ty_text).ok_or_else(|| corrupt(&format!("bad column type `{ty_text}`")))?;
        let serial = r.int()? != 0;
        let ncons = r.int()? as usize;
        let mut constraints = Vec::with_capacity(ncons);
        for _ in 0..ncons {
            constraints.push(decode_column_constraint(&mut r)?);
        }
        columns.push(ColumnSchema {
            name: col_name,
            ty,
            serial,
            constraints,
        });
    }
    let ntcons = r.int()? as usize;
    let mut constraints = Vec::with_capacity(ntcons);
    for _ in 0..ntcons {
        constraints.push(decode_table_constraint(&mut r)?);
    }
    Ok(TableSchema {
        name,
        columns,
        constraints,
        root_page,
        next_rowid,
        max_integer_pk,
    })
}

fn encode_index(i: &IndexDef) -> Row {
    let mut row = vec![Value::text(i.name.clone()), Value::text(i.table.clone())];
    encode_names(&mut row, &i.columns);
    row.push(Value::int(matches!(i.kind, IndexKind::Hnsw) as i64));
    row.push(Value::int(i.unique as i64));
    row.push(Value::int(i.root_page as i64));
    row.push(match &i.predicate {
        Some(p) => Value::text(p.clone()),
        None => Value::Null,
    });
    row.push(Value::int(i.hnsw.m as i64));
    row.push(Value::int(i.hnsw.ef_construction as i64));
    row
}

fn decode_index(row: &Row) -> Result<IndexDef, DBError> {
    let mut r = RowReader::new(row);
    let name = r.text()?;
    let table = r.text()?;
    let columns = decode_names(&mut r)?;
    let kind = if r.int()? != 0 { IndexKind::Hnsw } else { IndexKind::BTree };
    let unique = r.int()? != 0;
    let root_page = r.int()? as u32;
    let predicate = r.opt_text()?;
    let hnsw = HnswParams {
        m: r.int()? as usize,
        ef_construction: r.int()? as usize,
    };
    Ok(IndexDef {
        name,
        table,
        columns,
        kind,
        unique,
        root_page,
        predicate,
        hnsw,
    })
}

fn encode_view(v: &ViewDef) -> Row {
    let mut row = vec![Value::text(v.name.clone()), Value::text(v.sql.clone())];
    match &v.columns {
        Some(cols) => {
            row.push(Value::int(1));
            encode_names(&mut row, cols);
        }
        None => row.push(Value::int(0)),
    }
    row
}

fn decode_view(row: &Row) -> Result<ViewDef, DBError> {
    let mut r = RowReader::new(row);
    let name = r.text()?;
    let sql = r.text()?;
    let columns = if r.int()? != 0 { Some(decode_names(&mut r)?) } else { None };
    Ok(ViewDef { name, sql, columns })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> TableSchema {
        TableSchema {
            name: "Orders".into(),
            columns: vec![
                ColumnSchema {
                    name: "id".into(),
                    ty: ColumnType::Int,
                    serial: true,
                    constraints: vec![ColumnConstraint::PrimaryKey],
                },
                ColumnSchema {
                    name: "user_id".into(),
                    ty: ColumnType::Int,
                    serial: false,
                    constraints: vec![
                        ColumnConstraint::NotNull,
                        ColumnConstraint::ForeignKey(ForeignKey {
                            table: "users".into(),
                            column: "id".into(),
                            on_delete: FkAction::Cascade,
                            on_update: FkAction::NoAction,
                        }),
                    ],
                },
                ColumnSchema {
                    name: "note".into(),
                    ty: ColumnType::Varchar(80),
                    serial: false,
                    constraints: vec![ColumnConstraint::Default("'-'".into())],
                },
            ],
            constraints: vec![TableConstraint::Check("user_id > 0".into())],
            root_page: 7,
            next_rowid: 42,
            max_integer_pk: 41,
        }
    }

    #[test]
    fn table_entry_round_trip() {
        let table = sample_table();
        let decoded = decode_table(&encode_table(&table)).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn catalog_round_trip() {
        let mut catalog = Catalog::new();
        catalog.insert_table(sample_table());
        catalog.insert_index(IndexDef {
            name: "idx_orders_user".into(),
            table: "Orders".into(),
            columns: vec!["user_id".into()],
            kind: IndexKind::BTree,
            unique: false,
            root_page: 9,
            predicate: Some("note IS NOT NULL".into()),
            hnsw: HnswParams::default(),
        });
        catalog.insert_view(ViewDef {
            name: "big".into(),
            sql: "SELECT id FROM Orders".into(),
            columns: Some(vec!["order_id".into()]),
        });

        let (reloaded, trigger_sql) = Catalog::from_rows(catalog.to_rows()).unwrap();
        assert!(trigger_sql.is_empty());
        assert_eq!(reloaded.table("orders").unwrap(), catalog.table("ORDERS").unwrap());
        assert_eq!(
            reloaded.index("idx_orders_user").unwrap(),
            catalog.index("IDX_ORDERS_USER").unwrap()
        );
        assert_eq!(reloaded.view("big").unwrap(), catalog.view("big").unwrap());
        assert_eq!(reloaded.indexes_for_table("orders").len(), 1);
    }
}
