use crate::{ListOptions, Model, Result, Table};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::sync::Arc;

const MEMORY: &str = ":memory:";

const RESOURCE_COLUMNS: &str = "
  pk TEXT PRIMARY KEY,
  cluster TEXT NOT NULL REFERENCES Cluster(pk) ON DELETE CASCADE,
  uid TEXT NOT NULL,
  version INTEGER NOT NULL,
  namespace TEXT NOT NULL,
  name TEXT NOT NULL,
  object TEXT NOT NULL";

/// A shared database connection.
///
/// All statements are serialized through a single connection. Each mutating operation runs in its
/// own transaction; [`Db::transaction`] groups several statements into one.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

// === impl Db ===

impl Db {
    /// Opens (or creates) the database at `path`. `:memory:` opens a private in-memory database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == MEMORY {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(MEMORY)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(&schema())?;
        tracing::debug!("Database initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` in a transaction, committing when it succeeds and rolling back otherwise.
    pub fn transaction<T>(&self, f: impl FnOnce(&Table<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&Table::new(&tx))?;
        tx.commit()?;
        Ok(out)
    }

    /// Runs read-only statements.
    pub fn read<T>(&self, f: impl FnOnce(&Table<'_>) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&Table::new(&conn))
    }

    pub fn insert<M: Model>(&self, m: &M) -> Result<()> {
        self.transaction(|t| t.insert(m))
    }

    pub fn update<M: Model>(&self, m: &M) -> Result<()> {
        self.transaction(|t| t.update(m))
    }

    pub fn delete<M: Model>(&self, m: &M) -> Result<()> {
        self.transaction(|t| t.delete(m))
    }

    pub fn get<M: Model>(&self, key: &M) -> Result<M> {
        self.read(|t| t.get(key))
    }

    pub fn list<M: Model>(&self, options: &ListOptions) -> Result<Vec<M>> {
        self.read(|t| t.list(options))
    }

    pub fn count<M: Model>(&self, options: &ListOptions) -> Result<u64> {
        self.read(|t| t.count::<M>(options))
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

fn schema() -> String {
    let mut ddl = String::from(
        "CREATE TABLE IF NOT EXISTS Cluster (
  pk TEXT PRIMARY KEY,
  uid TEXT NOT NULL,
  version INTEGER NOT NULL,
  namespace TEXT NOT NULL,
  name TEXT NOT NULL,
  object TEXT NOT NULL,
  host INTEGER NOT NULL,
  UNIQUE (namespace, name)
);
",
    );
    for (table, extra) in [
        ("Namespace", ""),
        ("Pod", ""),
        ("PersistentVolume", ""),
        ("PersistentVolumeClaim", ""),
        ("Service", ""),
        ("Role", ",\n  rules TEXT NOT NULL"),
        ("RoleBinding", ",\n  role TEXT NOT NULL"),
    ] {
        ddl.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {table} ({RESOURCE_COLUMNS}{extra},
  UNIQUE (cluster, namespace, name)
);
CREATE INDEX IF NOT EXISTS {table}_cluster ON {table} (cluster);
"
        ));
    }
    ddl.push_str(
        "CREATE TABLE IF NOT EXISTS Subject (
  parent TEXT NOT NULL REFERENCES RoleBinding(pk) ON DELETE CASCADE,
  kind TEXT NOT NULL,
  namespace TEXT NOT NULL,
  name TEXT NOT NULL,
  UNIQUE (parent, kind, namespace, name)
);
CREATE INDEX IF NOT EXISTS Subject_identity ON Subject (kind, namespace, name);
",
    );
    ddl
}
