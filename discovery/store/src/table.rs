use crate::{Error, Result};
use rusqlite::{types::Value, Connection, Row, ToSql};
use sha2::{Digest, Sha256};
use std::fmt;

/// A row type mapped onto a table.
///
/// The table's first column is always `pk`, derived from the row's identity by [`Model::pk`];
/// [`Model::COLUMNS`] name the remaining columns in the order [`Model::values`] produces them and
/// [`Model::from_row`] reads them (starting at index 1).
pub trait Model: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];

    fn pk(&self) -> String;

    fn values(&self) -> Vec<Value>;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    /// Writes rows owned by this row. Runs in the same transaction as the insert.
    fn insert_children(&self, _table: &Table<'_>) -> Result<()> {
        Ok(())
    }

    /// Replaces rows owned by this row. Runs in the same transaction as the update.
    fn update_children(&self, _table: &Table<'_>) -> Result<()> {
        Ok(())
    }

    /// Removes rows owned by this row. Runs in the same transaction as the delete.
    fn delete_children(&self, _table: &Table<'_>) -> Result<()> {
        Ok(())
    }

    /// Loads rows owned by this row after it has been read.
    fn load_children(&mut self, _table: &Table<'_>) -> Result<()> {
        Ok(())
    }
}

/// Derives a primary key from identity parts.
pub fn pk(parts: &[&str]) -> String {
    let mut hash = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hash.update([0u8]);
        }
        hash.update(part.as_bytes());
    }
    format!("{:x}", hash.finalize())
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Page {
    pub offset: u64,
    pub limit: u64,
}

/// Selects rows for [`Table::list`] and [`Table::count`].
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Column equality predicates, joined with `AND`.
    pub filter: Vec<(&'static str, Value)>,
    pub page: Option<Page>,
    /// 1-based column ordinals (`pk` is 1).
    pub sort: Vec<usize>,
}

/// Executes statements against a connection or an open transaction.
pub struct Table<'c> {
    conn: &'c Connection,
}

// === impl ListOptions ===

impl ListOptions {
    pub fn eq(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.filter.push((column, value.into()));
        self
    }

    pub fn page(mut self, offset: u64, limit: u64) -> Self {
        self.page = Some(Page { offset, limit });
        self
    }

    pub fn sort(mut self, ordinals: impl IntoIterator<Item = usize>) -> Self {
        self.sort.extend(ordinals);
        self
    }

    fn where_clause<M: Model>(&self) -> Result<String> {
        if self.filter.is_empty() {
            return Ok(String::new());
        }
        let mut predicates = Vec::with_capacity(self.filter.len());
        for (i, (column, _)) in self.filter.iter().enumerate() {
            if !M::COLUMNS.contains(column) && *column != "pk" {
                return Err(Error::Invalid(format!("{}.{column}", M::TABLE)));
            }
            predicates.push(format!("{column} = :f{i}"));
        }
        Ok(format!(" WHERE {}", predicates.join(" AND ")))
    }

    fn order_clause<M: Model>(&self) -> Result<String> {
        if self.sort.is_empty() {
            return Ok(String::new());
        }
        let ordinals = self
            .sort
            .iter()
            .map(|&n| {
                if n == 0 || n > M::COLUMNS.len() + 1 {
                    return Err(Error::Invalid(format!("{} sort ordinal {n}", M::TABLE)));
                }
                Ok(n.to_string())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(format!(" ORDER BY {}", ordinals.join(", ")))
    }

    fn params(&self) -> Vec<(String, Value)> {
        let mut params = self
            .filter
            .iter()
            .enumerate()
            .map(|(i, (_, v))| (format!(":f{i}"), v.clone()))
            .collect::<Vec<_>>();
        if let Some(Page { offset, limit }) = self.page {
            params.push((":limit".to_string(), Value::Integer(limit as i64)));
            params.push((":offset".to_string(), Value::Integer(offset as i64)));
        }
        params
    }
}

// === impl Table ===

impl<'c> Table<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn insert<M: Model>(&self, m: &M) -> Result<()> {
        let columns = M::COLUMNS.join(", ");
        let names = M::COLUMNS
            .iter()
            .map(|c| format!(":{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} (pk, {columns}) VALUES (:pk, {names})",
            M::TABLE
        );
        self.execute(&sql, row_params(m))?;
        m.insert_children(self)
    }

    /// Updates the row; fails with [`Error::NotFound`] when no row has the derived key.
    pub fn update<M: Model>(&self, m: &M) -> Result<()> {
        let assignments = M::COLUMNS
            .iter()
            .map(|c| format!("{c} = :{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("UPDATE {} SET {assignments} WHERE pk = :pk", M::TABLE);
        if self.execute(&sql, row_params(m))? == 0 {
            return Err(Error::NotFound);
        }
        m.update_children(self)
    }

    /// Deletes the row. Deleting an absent row is not an error.
    pub fn delete<M: Model>(&self, m: &M) -> Result<()> {
        m.delete_children(self)?;
        let sql = format!("DELETE FROM {} WHERE pk = :pk", M::TABLE);
        self.execute(&sql, vec![(":pk".to_string(), Value::Text(m.pk()))])?;
        Ok(())
    }

    /// Reads the row identified by `key`.
    pub fn get<M: Model>(&self, key: &M) -> Result<M> {
        let sql = format!("{} WHERE pk = :pk", select::<M>());
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut m = stmt.query_row(&[(":pk", &key.pk() as &dyn ToSql)], M::from_row)?;
        m.load_children(self)?;
        Ok(m)
    }

    pub fn list<M: Model>(&self, options: &ListOptions) -> Result<Vec<M>> {
        let mut sql = format!(
            "{}{}{}",
            select::<M>(),
            options.where_clause::<M>()?,
            options.order_clause::<M>()?
        );
        if options.page.is_some() {
            sql.push_str(" LIMIT :limit OFFSET :offset");
        }
        self.query(&sql, options.params())
    }

    pub fn count<M: Model>(&self, options: &ListOptions) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}{}",
            M::TABLE,
            options.where_clause::<M>()?
        );
        let params = options
            .params()
            .into_iter()
            .filter(|(name, _)| name.starts_with(":f"))
            .collect::<Vec<_>>();
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let n: i64 = stmt.query_row(named(&params).as_slice(), |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Runs a query selecting the model's columns (`pk` first).
    pub fn query<M: Model>(&self, sql: &str, params: Vec<(String, Value)>) -> Result<Vec<M>> {
        let rows = self.map_rows(sql, params, M::from_row)?;
        let mut list = Vec::with_capacity(rows.len());
        for mut m in rows {
            m.load_children(self)?;
            list.push(m);
        }
        Ok(list)
    }

    /// Runs a query, mapping each row with `f`.
    pub fn map_rows<T>(
        &self,
        sql: &str,
        params: Vec<(String, Value)>,
        f: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(named(&params).as_slice(), f)?
            .collect::<rusqlite::Result<Vec<T>>>()?;
        Ok(rows)
    }

    /// Executes a statement with named parameters, returning the number of rows changed.
    pub fn execute(&self, sql: &str, params: Vec<(String, Value)>) -> Result<usize> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        Ok(stmt.execute(named(&params).as_slice())?)
    }
}

fn select<M: Model>() -> String {
    format!("SELECT pk, {} FROM {}", M::COLUMNS.join(", "), M::TABLE)
}

fn row_params<M: Model>(m: &M) -> Vec<(String, Value)> {
    std::iter::once((":pk".to_string(), Value::Text(m.pk())))
        .chain(
            M::COLUMNS
                .iter()
                .map(|c| format!(":{c}"))
                .zip(m.values()),
        )
        .collect()
}

fn named(params: &[(String, Value)]) -> Vec<(&str, &dyn ToSql)> {
    params
        .iter()
        .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
        .collect()
}
