// SPDX-License-Identifier: Apache-2.0

//! The client seam the SQL reader drives.
//!
//! Actual drivers live outside this crate; embedders register a reader kind
//! bound to a concrete [`SqlClient`]. Values cross the seam as the closed
//! [`SqlValue`] set with typed converters, dispatched on the declared column
//! schema rather than on runtime reflection.

use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    MsSql,
    Postgres,
}

const MYSQL_SYSTEM_DATABASES: &[&str] = &["information_schema", "performance_schema", "mysql", "sys"];

impl Dialect {
    pub fn from_mode(mode: &str) -> Result<Dialect> {
        match mode {
            "mysql" => Ok(Dialect::MySql),
            "mssql" => Ok(Dialect::MsSql),
            "postgres" => Ok(Dialect::Postgres),
            other => Err(Error::Sql(format!("mode {:?} not supported", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::MySql => "mysql",
            Dialect::MsSql => "mssql",
            Dialect::Postgres => "postgres",
        }
    }

    /// Databases excluded from discovery.
    pub fn system_databases(&self) -> &'static [&'static str] {
        match self {
            Dialect::MySql => MYSQL_SYSTEM_DATABASES,
            _ => &[],
        }
    }

    /// Only MySQL enumerates databases; the others work within their single
    /// declared database.
    pub fn database_query(&self) -> Option<&'static str> {
        match self {
            Dialect::MySql => Some("SHOW DATABASES;"),
            _ => None,
        }
    }

    pub fn default_schema(&self) -> &'static str {
        match self {
            Dialect::MySql => "",
            Dialect::MsSql => "dbo",
            Dialect::Postgres => "public",
        }
    }

    pub fn table_query(&self, database: &str, schema: &str) -> String {
        match self {
            Dialect::MySql => format!(
                "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_TYPE='BASE TABLE' AND TABLE_SCHEMA='{}';",
                database
            ),
            Dialect::Postgres => {
                format!("SELECT TABLENAME FROM PG_TABLES WHERE SCHEMANAME='{}';", schema)
            }
            Dialect::MsSql => format!(
                "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_TYPE='BASE TABLE' AND TABLE_CATALOG='{}' AND TABLE_SCHEMA='{}';",
                database, schema
            ),
        }
    }

    pub fn quote_table(&self, schema: &str, table: &str) -> String {
        match self {
            Dialect::MySql => format!("`{}`", table),
            Dialect::MsSql | Dialect::Postgres => format!("\"{}\".\"{}\"", schema, table),
        }
    }

    /// Row-count query for one table; drives the backlog gauge, not the
    /// read path.
    pub fn count_query(&self, schema: &str, table: &str) -> String {
        format!("Select Count(*) From {};", self.quote_table(schema, table))
    }

    /// Bound `raw_sql` to an offset window `[from, to)` over `key`.
    pub fn offset_window(&self, raw_sql: &str, key: &str, from: i64, to: i64) -> String {
        let raw = raw_sql.trim().trim_end_matches(';');
        match self {
            Dialect::MySql | Dialect::Postgres => {
                format!("{} WHERE {} >= {} AND {} < {};", raw, key, from, key, to)
            }
            Dialect::MsSql => format!(
                "{} WHERE CAST({} AS BIGINT) >= {} AND CAST({} AS BIGINT) < {};",
                raw, key, from, key, to
            ),
        }
    }

    /// Probe whether any record at or beyond `from` exists; used to decide
    /// between advancing the window and stopping.
    pub fn next_record_query(&self, raw_sql: &str, key: &str, from: i64) -> Option<String> {
        let raw = raw_sql.trim().trim_end_matches(';');
        match self {
            Dialect::MySql => Some(format!(
                "{} WHERE {} >= {} order by {} limit 1;",
                raw, key, from, key
            )),
            Dialect::MsSql | Dialect::Postgres => {
                let ix = raw.find("from")?;
                Some(format!(
                    "select top(1) * {} WHERE CAST({} AS BIGINT) >= {} order by CAST({} AS BIGINT);",
                    &raw[ix..], key, from, key
                ))
            }
        }
    }
}

/// A scanned cell. The closed set every client must coerce into.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Long(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Bytes(Vec<u8>),
    Null,
}

impl SqlValue {
    pub fn as_long(&self) -> Result<i64> {
        match self {
            SqlValue::Long(v) => Ok(*v),
            SqlValue::Text(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|e| Error::Sql(format!("cannot convert {:?} to long: {}", s, e))),
            SqlValue::Bytes(b) => {
                if b.len() == 8 {
                    Ok(i64::from_be_bytes(b[..8].try_into().expect("length checked")))
                } else {
                    let s = String::from_utf8_lossy(b);
                    s.trim()
                        .parse::<i64>()
                        .map_err(|e| Error::Sql(format!("cannot convert {:?} to long: {}", s, e)))
                }
            }
            SqlValue::Null => Ok(0),
            other => Err(Error::Sql(format!("{:?} cannot convert to long", other))),
        }
    }

    pub fn as_float(&self) -> Result<f64> {
        match self {
            SqlValue::Float(v) => Ok(*v),
            SqlValue::Long(v) => Ok(*v as f64),
            SqlValue::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|e| Error::Sql(format!("cannot convert {:?} to float: {}", s, e))),
            SqlValue::Bytes(b) => {
                let s = String::from_utf8_lossy(b);
                s.trim()
                    .parse::<f64>()
                    .map_err(|e| Error::Sql(format!("cannot convert {:?} to float: {}", s, e)))
            }
            SqlValue::Null => Ok(0.0),
            other => Err(Error::Sql(format!("{:?} cannot convert to float", other))),
        }
    }

    pub fn as_text(&self) -> Result<String> {
        match self {
            SqlValue::Text(s) => Ok(s.clone()),
            SqlValue::Long(v) => Ok(v.to_string()),
            SqlValue::Float(v) => Ok(v.to_string()),
            SqlValue::Bool(v) => Ok(v.to_string()),
            SqlValue::Bytes(b) => Ok(String::from_utf8_lossy(b).into_owned()),
            SqlValue::Null => Ok(String::new()),
        }
    }

    /// Natural JSON mapping when no schema override is declared.
    pub fn to_json(&self) -> Value {
        match self {
            SqlValue::Long(v) => Value::from(*v),
            SqlValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            SqlValue::Text(s) => Value::String(s.clone()),
            SqlValue::Bool(v) => Value::Bool(*v),
            SqlValue::Bytes(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
            SqlValue::Null => Value::Null,
        }
    }

    /// Approximate wire size of the cell.
    pub fn byte_size(&self) -> i64 {
        match self {
            SqlValue::Text(s) => s.len() as i64,
            SqlValue::Bytes(b) => b.len() as i64,
            SqlValue::Null => 0,
            SqlValue::Bool(_) => 1,
            _ => 8,
        }
    }
}

/// One result set.
#[derive(Debug, Clone, Default)]
pub struct SqlRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl SqlRows {
    pub fn single_column(values: Vec<&str>) -> SqlRows {
        SqlRows {
            columns: vec!["name".to_string()],
            rows: values
                .into_iter()
                .map(|v| vec![SqlValue::Text(v.to_string())])
                .collect(),
        }
    }
}

/// The connection the SQL reader drives. `database` selects the logical
/// database for the query (empty for server-level queries).
pub trait SqlClient: Send {
    fn query(&mut self, database: &str, sql: &str) -> Result<SqlRows>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_windows_per_dialect() {
        let raw = "select * from t;";
        assert_eq!(
            Dialect::MySql.offset_window(raw, "id", 10, 110),
            "select * from t WHERE id >= 10 AND id < 110;"
        );
        assert_eq!(
            Dialect::MsSql.offset_window(raw, "id", 0, 100),
            "select * from t WHERE CAST(id AS BIGINT) >= 0 AND CAST(id AS BIGINT) < 100;"
        );
    }

    #[test]
    fn next_record_probe() {
        assert_eq!(
            Dialect::MySql.next_record_query("select * from t;", "id", 5),
            Some("select * from t WHERE id >= 5 order by id limit 1;".to_string())
        );
        let probe = Dialect::MsSql
            .next_record_query("select * from t", "id", 5)
            .unwrap();
        assert!(probe.starts_with("select top(1) * from t"));
        assert!(Dialect::MsSql.next_record_query("select 1", "id", 5).is_none());
    }

    #[test]
    fn value_converters() {
        assert_eq!(SqlValue::Long(7).as_long().unwrap(), 7);
        assert_eq!(SqlValue::Text("42".into()).as_long().unwrap(), 42);
        assert_eq!(
            SqlValue::Bytes(8i64.to_be_bytes().to_vec()).as_long().unwrap(),
            8
        );
        assert_eq!(SqlValue::Bytes(b"19".to_vec()).as_long().unwrap(), 19);
        assert_eq!(SqlValue::Null.as_long().unwrap(), 0);
        assert!(SqlValue::Bool(true).as_long().is_err());

        assert_eq!(SqlValue::Long(2).as_float().unwrap(), 2.0);
        assert_eq!(SqlValue::Text("2.5".into()).as_float().unwrap(), 2.5);

        assert_eq!(SqlValue::Float(1.5).as_text().unwrap(), "1.5");
        assert_eq!(SqlValue::Bytes(b"abc".to_vec()).as_text().unwrap(), "abc");
    }

    #[test]
    fn system_databases_only_for_mysql() {
        assert!(Dialect::MySql
            .system_databases()
            .contains(&"information_schema"));
        assert!(Dialect::Postgres.system_databases().is_empty());
    }

    #[test]
    fn table_quoting() {
        assert_eq!(Dialect::MySql.quote_table("", "t"), "`t`");
        assert_eq!(Dialect::Postgres.quote_table("public", "t"), "\"public\".\"t\"");
    }

    #[test]
    fn count_query_uses_quoted_table() {
        assert_eq!(
            Dialect::MySql.count_query("", "events"),
            "Select Count(*) From `events`;"
        );
        assert_eq!(
            Dialect::Postgres.count_query("public", "events"),
            "Select Count(*) From \"public\".\"events\";"
        );
    }
}
