//! In-memory reference database backed by SQLite.
//!
//! Statements written for MySQL or SQL Server are parsed with `sqlparser`
//! before SQLite sees them. Qualified names (`db.schema.table`) resolve to
//! their last segment, and `CREATE TABLE` keeps only column names and types,
//! so trailing options such as `ENGINE=InnoDB` are accepted. SQLite has no
//! `TRUNCATE`; use `DELETE FROM` to clear a table.

use super::{Connection, ConnectionProvider};
use crate::error::DbError;
use crate::types::{ConnectionId, ConnectionTarget, Row, SqlValue};
use rusqlite::types::{Value, ValueRef};
use sqlparser::ast::{visit_relations_mut, CreateTable, ObjectName, Statement};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A named in-memory database implementing [`Connection`].
pub struct MemoryDatabase {
    name: String,
    conn: Mutex<rusqlite::Connection>,
    reachable: AtomicBool,
    fail_on: Mutex<Vec<String>>,
    statements: Mutex<Vec<String>>,
    insert_limit: Mutex<Option<u64>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn rejected(err: rusqlite::Error) -> DbError {
    DbError::Rejected(err.to_string())
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> Result<Self, DbError> {
        let conn = rusqlite::Connection::open_in_memory().map_err(rejected)?;
        Ok(Self {
            name: name.into(),
            conn: Mutex::new(conn),
            reachable: AtomicBool::new(true),
            fail_on: Mutex::new(Vec::new()),
            statements: Mutex::new(Vec::new()),
            insert_limit: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create (or replace) a table with the given rows.
    pub fn with_table(
        self,
        table: &str,
        columns: &[&str],
        rows: Vec<Vec<SqlValue>>,
    ) -> Result<Self, DbError> {
        {
            let conn = self.lock_conn()?;
            let table = quote(&last_segment(table));
            let columns: Vec<String> = columns.iter().map(|c| quote(c)).collect();
            conn.execute_batch(&format!(
                "DROP TABLE IF EXISTS {table}; CREATE TABLE {table} ({});",
                columns.join(", ")
            ))
            .map_err(rejected)?;

            let mut stmt = conn
                .prepare(&format!("INSERT INTO {table} VALUES ({})", placeholders(columns.len())))
                .map_err(rejected)?;
            for values in &rows {
                stmt.execute(rusqlite::params_from_iter(values.iter().map(to_sqlite)))
                    .map_err(rejected)?;
            }
        }
        Ok(self)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Reject any statement containing `fragment` (case-insensitive).
    pub fn fail_on(&self, fragment: impl Into<String>) {
        lock(&self.fail_on).push(fragment.into().to_ascii_lowercase());
    }

    /// Reject any `insert_rows` call that would push the total rows accepted
    /// through that path past `limit`.
    pub fn limit_inserts(&self, limit: u64) {
        *lock(&self.insert_limit) = Some(limit);
    }

    pub fn has_table(&self, table: &str) -> bool {
        let Ok(conn) = self.lock_conn() else {
            return false;
        };
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            [last_segment(table)],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n > 0)
        .unwrap_or(false)
    }

    pub fn row_count(&self, table: &str) -> Option<usize> {
        if !self.has_table(table) {
            return None;
        }
        let conn = self.lock_conn().ok()?;
        conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote(&last_segment(table))),
            [],
            |row| row.get::<_, i64>(0),
        )
        .ok()
        .map(|n| n as usize)
    }

    pub fn rows(&self, table: &str) -> Option<Vec<Row>> {
        if !self.has_table(table) {
            return None;
        }
        let conn = self.lock_conn().ok()?;
        select_rows(&conn, &format!("SELECT * FROM {}", quote(&last_segment(table)))).ok()
    }

    /// Every statement submitted through `execute` or `query`, in order.
    pub fn statements(&self) -> Vec<String> {
        lock(&self.statements).clone()
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>, DbError> {
        self.conn
            .lock()
            .map_err(|_| DbError::Rejected(format!("database '{}' lock poisoned", self.name)))
    }

    fn admit(&self, statement: &str) -> Result<(), DbError> {
        if !self.is_reachable() {
            return Err(DbError::Unreachable(format!("database '{}' is down", self.name)));
        }
        lock(&self.statements).push(statement.to_string());

        let lowered = statement.to_ascii_lowercase();
        if let Some(fragment) = lock(&self.fail_on).iter().find(|f| lowered.contains(f.as_str())) {
            return Err(DbError::Rejected(format!("injected failure on '{}'", fragment)));
        }
        Ok(())
    }
}

/// A statement rewritten for SQLite.
struct Rewritten {
    sql: String,
    returns_rows: bool,
}

fn rewrite(sql: &str) -> Result<Vec<Rewritten>, DbError> {
    let statements = Parser::parse_sql(&MySqlDialect {}, sql)
        .map_err(|e| DbError::Rejected(format!("syntax error: {}", e)))?;
    Ok(statements.into_iter().map(rewrite_statement).collect())
}

fn rewrite_statement(mut statement: Statement) -> Rewritten {
    if let Statement::CreateTable(create) = &statement {
        return Rewritten {
            sql: create_table_sql(create),
            returns_rows: false,
        };
    }

    if let Statement::Drop { names, .. } = &mut statement {
        names.iter_mut().for_each(shorten);
    }
    let _ = visit_relations_mut(&mut statement, |name| {
        shorten(name);
        ControlFlow::<()>::Continue(())
    });

    Rewritten {
        returns_rows: matches!(statement, Statement::Query(_)),
        sql: statement.to_string(),
    }
}

fn create_table_sql(create: &CreateTable) -> String {
    let columns: Vec<String> = create
        .columns
        .iter()
        .map(|c| format!("{} {}", c.name, c.data_type))
        .collect();
    let name = create.name.0.last().map(|ident| ident.to_string()).unwrap_or_default();
    format!(
        "CREATE TABLE {}{} ({})",
        if create.if_not_exists { "IF NOT EXISTS " } else { "" },
        name,
        columns.join(", ")
    )
}

/// `db.schema.table` becomes `table`.
fn shorten(name: &mut ObjectName) {
    if name.0.len() > 1 {
        let keep = name.0.len() - 1;
        name.0.drain(..keep);
    }
}

/// Last segment of a dotted name, without identifier quotes.
fn last_segment(name: &str) -> String {
    name.rsplit('.')
        .next()
        .unwrap_or(name)
        .trim_matches(|c| matches!(c, '`' | '"' | '[' | ']'))
        .to_string()
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// `?1, ?2, ...` for `n` parameters.
fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
}

fn to_sqlite(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(b) => Value::Integer(i64::from(*b)),
        SqlValue::Integer(i) => Value::Integer(*i),
        SqlValue::Float(f) => Value::Real(*f),
        SqlValue::Text(s) => Value::Text(s.clone()),
    }
}

fn from_sqlite(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Float(f),
        ValueRef::Text(t) | ValueRef::Blob(t) => {
            SqlValue::Text(String::from_utf8_lossy(t).into_owned())
        }
    }
}

fn select_rows(conn: &rusqlite::Connection, sql: &str) -> Result<Vec<Row>, rusqlite::Error> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let values = (0..columns.len())
            .map(|i| row.get_ref(i).map(from_sqlite))
            .collect::<Result<Vec<_>, _>>()?;
        out.push(Row::new(columns.clone(), values));
    }
    Ok(out)
}

#[async_trait::async_trait]
impl Connection for MemoryDatabase {
    async fn execute(&self, statement: &str) -> Result<u64, DbError> {
        self.admit(statement)?;
        let rewritten = rewrite(statement)?;

        let conn = self.lock_conn()?;
        let mut affected = 0u64;
        for stmt in rewritten {
            tracing::debug!(database = %self.name, sql = %stmt.sql, "Executing statement");
            affected += if stmt.returns_rows {
                select_rows(&conn, &stmt.sql).map_err(rejected)?.len() as u64
            } else {
                conn.execute(&stmt.sql, []).map_err(rejected)? as u64
            };
        }
        Ok(affected)
    }

    async fn query(&self, statement: &str) -> Result<Vec<Row>, DbError> {
        self.admit(statement)?;
        let rewritten = rewrite(statement)?;
        let [Rewritten { sql, returns_rows: true }] = rewritten.as_slice() else {
            return Err(DbError::Rejected("statement does not return rows".to_string()));
        };

        let conn = self.lock_conn()?;
        select_rows(&conn, sql).map_err(rejected)
    }

    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<u64, DbError> {
        if !self.is_reachable() {
            return Err(DbError::Unreachable(format!("database '{}' is down", self.name)));
        }
        let mut limit = lock(&self.insert_limit);
        if let Some(remaining) = *limit {
            if rows.len() as u64 > remaining {
                return Err(DbError::Rejected(format!(
                    "insert of {} row(s) exceeds remaining capacity {}",
                    rows.len(),
                    remaining
                )));
            }
        }

        let table = quote(&last_segment(table));
        let mut conn = self.lock_conn()?;
        // All rows of one call land together or not at all.
        let tx = conn.transaction().map_err(rejected)?;
        for row in rows {
            let columns: Vec<String> = row.columns.iter().map(|c| quote(c)).collect();
            let sql = format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                columns.join(", "),
                placeholders(row.values.len())
            );
            let params = rusqlite::params_from_iter(row.values.iter().map(to_sqlite));
            tx.prepare_cached(&sql)
                .and_then(|mut stmt| stmt.execute(params))
                .map_err(rejected)?;
        }
        tx.commit().map_err(rejected)?;

        let written = rows.len() as u64;
        if let Some(remaining) = limit.as_mut() {
            *remaining -= written;
        }
        Ok(written)
    }
}

/// Maps connection ids to in-memory databases.
#[derive(Default)]
pub struct MemoryConnectionProvider {
    databases: HashMap<ConnectionId, Arc<MemoryDatabase>>,
}

impl MemoryConnectionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database(mut self, id: impl Into<String>, database: Arc<MemoryDatabase>) -> Self {
        self.insert(id, database);
        self
    }

    pub fn insert(&mut self, id: impl Into<String>, database: Arc<MemoryDatabase>) {
        self.databases.insert(ConnectionId::new(id), database);
    }

    pub fn database(&self, id: &str) -> Option<Arc<MemoryDatabase>> {
        self.databases.get(&ConnectionId::new(id)).cloned()
    }
}

#[async_trait::async_trait]
impl ConnectionProvider for MemoryConnectionProvider {
    async fn get_connection(
        &self,
        target: &ConnectionTarget,
    ) -> Result<Arc<dyn Connection>, DbError> {
        let db = self
            .databases
            .get(&target.connection)
            .ok_or_else(|| {
                DbError::Unreachable(format!("no connection registered as '{}'", target.connection))
            })?;

        if !db.is_reachable() {
            return Err(DbError::Unreachable(format!("database '{}' is down", db.name())));
        }

        tracing::debug!(connection = %target, "Handing out in-memory connection");
        Ok(db.clone() as Arc<dyn Connection>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MYSQL_CREATE: &str =
        "CREATE TABLE airflow_test (a int(11) DEFAULT NULL) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;";

    #[tokio::test]
    async fn test_setup_and_teardown_are_idempotent() {
        let db = MemoryDatabase::new("mysql").unwrap();

        db.execute("DROP TABLE IF EXISTS airflow_test ;").await.unwrap();
        db.execute(MYSQL_CREATE).await.unwrap();
        assert!(db.has_table("airflow_test"));
        db.execute("DROP TABLE IF EXISTS airflow_test ;").await.unwrap();
        db.execute("DROP TABLE IF EXISTS airflow_test ;").await.unwrap();
        assert!(!db.has_table("airflow_test"));

        assert!(db.execute("DROP TABLE airflow_test").await.is_err());
    }

    #[tokio::test]
    async fn test_insert_and_select() {
        let db = MemoryDatabase::new("mysql").unwrap();
        db.execute("CREATE TABLE t (a int, b varchar(20))").await.unwrap();

        let n = db
            .execute("INSERT INTO t (a, b) VALUES (1, 'x'), (2, 'it''s')")
            .await
            .unwrap();
        assert_eq!(n, 2);
        db.execute("INSERT INTO t (b) VALUES ('only b')").await.unwrap();

        let rows = db.query("select a from test.t").await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].get("a"), Some(&SqlValue::Integer(1)));
        assert_eq!(rows[2].get("a"), Some(&SqlValue::Null));

        let all = db.query("SELECT * FROM t;").await.unwrap();
        assert_eq!(all[1].get("b"), Some(&SqlValue::Text("it's".into())));

        assert_eq!(db.execute("DELETE FROM test.t").await.unwrap(), 3);
        assert_eq!(db.row_count("t"), Some(0));
    }

    #[tokio::test]
    async fn test_qualified_drop_resolves_last_segment() {
        let db = MemoryDatabase::new("mssql").unwrap();
        db.execute("CREATE TABLE test.dbo.airflow_test (a int)").await.unwrap();
        assert!(db.has_table("airflow_test"));

        db.execute("DROP TABLE test.dbo.airflow_test").await.unwrap();
        assert!(!db.has_table("airflow_test"));
    }

    #[tokio::test]
    async fn test_malformed_statements_are_rejected() {
        let db = MemoryDatabase::new("mysql").unwrap();
        for sql in [
            "CREATE TABLE t (a int",
            "CREATE TABLE t ()",
            "CRATE TABLE t (a int)",
            "INSERT INTO t VALUES (1",
            "SELECT a FROM",
            "DROP TABLE t extra",
            "SELECT a FROM missing",
        ] {
            assert!(
                matches!(db.execute(sql).await, Err(DbError::Rejected(_))),
                "expected rejection for {sql}"
            );
        }
        assert!(matches!(db.query("DELETE FROM t").await, Err(DbError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_insert_rows_maps_by_column_name() {
        let db = MemoryDatabase::new("mssql")
            .unwrap()
            .with_table("airflow_test", &["a", "b"], vec![])
            .unwrap();
        let rows = vec![Row::new(vec!["B".into()], vec![SqlValue::Integer(7)])];

        let written = db.insert_rows("test.dbo.airflow_test", &rows).await.unwrap();
        assert_eq!(written, 1);
        let stored = db.rows("airflow_test").unwrap();
        assert_eq!(stored[0].values, vec![SqlValue::Null, SqlValue::Integer(7)]);

        // The bad row rolls back the good one before it.
        let mixed = vec![
            Row::new(vec!["a".into()], vec![SqlValue::Integer(1)]),
            Row::new(vec!["zzz".into()], vec![SqlValue::Integer(1)]),
        ];
        assert!(db.insert_rows("airflow_test", &mixed).await.is_err());
        assert_eq!(db.row_count("airflow_test"), Some(1));
    }

    #[tokio::test]
    async fn test_seeded_rows_keep_their_types() {
        let db = MemoryDatabase::new("mysql")
            .unwrap()
            .with_table(
                "t",
                &["a", "b"],
                vec![
                    vec![SqlValue::Integer(1), SqlValue::Text("x".into())],
                    vec![SqlValue::Float(2.5), SqlValue::Null],
                ],
            )
            .unwrap();

        let rows = db.query("SELECT a, b FROM t").await.unwrap();
        assert_eq!(rows[0].values, vec![SqlValue::Integer(1), SqlValue::Text("x".into())]);
        assert_eq!(rows[1].values, vec![SqlValue::Float(2.5), SqlValue::Null]);
        assert_eq!(db.rows("missing"), None);
    }

    #[tokio::test]
    async fn test_unreachable_and_injected_failures() {
        let db = Arc::new(MemoryDatabase::new("mysql").unwrap());
        let provider = MemoryConnectionProvider::new().with_database("mysql_local", db.clone());

        db.fail_on("create table");
        let conn = provider.get_connection(&ConnectionTarget::new("mysql_local")).await.unwrap();
        assert!(matches!(conn.execute("CREATE TABLE t (a int)").await, Err(DbError::Rejected(_))));
        assert!(!db.has_table("t"));

        db.set_reachable(false);
        assert!(matches!(
            provider.get_connection(&ConnectionTarget::new("mysql_local")).await,
            Err(DbError::Unreachable(_))
        ));
        assert!(matches!(
            provider.get_connection(&ConnectionTarget::new("missing")).await,
            Err(DbError::Unreachable(_))
        ));
    }
}
