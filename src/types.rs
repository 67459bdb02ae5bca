use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use serde_json::Value as JsonValue;

use crate::error::StorageError;

/// Scalar values accepted as positional `?` arguments and returned by [`crate::Row::value`].
///
/// The set is closed on purpose; build queries from these and the compiler rejects
/// anything the engine cannot bind:
/// ```rust
/// use resilient_sqlite::{Query, SqlValue};
///
/// let query = Query::new("INSERT INTO certs (key, value) VALUES (?, ?)")
///     .arg("example.org")
///     .arg(vec![0xde_u8, 0xad]);
/// assert_eq!(query.args[0], SqlValue::Text("example.org".into()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    /// 32-bit integer
    Integer(i32),
    /// 64-bit integer
    Int64(i64),
    Double(f64),
    Blob(Vec<u8>),
    Null,
}

impl SqlValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let SqlValue::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(value) => Some(i64::from(*value)),
            SqlValue::Int64(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        if let SqlValue::Blob(value) = self {
            Some(value)
        } else {
            None
        }
    }

    /// Kind name used in diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SqlValue::Text(_) => "text",
            SqlValue::Integer(_) => "integer",
            SqlValue::Int64(_) => "int64",
            SqlValue::Double(_) => "double",
            SqlValue::Blob(_) => "blob",
            SqlValue::Null => "null",
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let borrowed = match self {
            SqlValue::Text(s) => ValueRef::Text(s.as_bytes()),
            SqlValue::Integer(i) => ValueRef::Integer(i64::from(*i)),
            SqlValue::Int64(i) => ValueRef::Integer(*i),
            SqlValue::Double(f) => ValueRef::Real(*f),
            SqlValue::Blob(b) => ValueRef::Blob(b),
            SqlValue::Null => ValueRef::Null,
        };
        Ok(ToSqlOutput::Borrowed(borrowed))
    }
}

impl From<Value> for SqlValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Integer(i) => SqlValue::Int64(i),
            Value::Real(f) => SqlValue::Double(f),
            Value::Text(s) => SqlValue::Text(s),
            Value::Blob(b) => SqlValue::Blob(b),
        }
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        Value::from(value).into()
    }
}

macro_rules! sql_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for SqlValue {
                fn from(value: $ty) -> Self {
                    SqlValue::$variant(value.into())
                }
            }
        )*
    };
}

sql_value_from! {
    String => Text,
    &str => Text,
    &String => Text,
    i32 => Integer,
    i16 => Integer,
    u16 => Integer,
    i64 => Int64,
    u32 => Int64,
    f64 => Double,
    f32 => Double,
    Vec<u8> => Blob,
    &[u8] => Blob,
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Integer(i32::from(value))
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(SqlValue::Null, Into::into)
    }
}

impl TryFrom<&JsonValue> for SqlValue {
    type Error = StorageError;

    /// Map loosely typed JSON scalars onto SQL arguments; arrays and objects have no
    /// scalar representation and are rejected.
    fn try_from(value: &JsonValue) -> Result<Self, Self::Error> {
        match value {
            JsonValue::Null => Ok(SqlValue::Null),
            JsonValue::Bool(b) => Ok(SqlValue::from(*b)),
            JsonValue::Number(n) => n
                .as_i64()
                .map(SqlValue::Int64)
                .or_else(|| n.as_f64().map(SqlValue::Double))
                .ok_or_else(|| {
                    StorageError::Parameter(format!("number {n} does not fit a SQL scalar"))
                }),
            JsonValue::String(s) => Ok(SqlValue::Text(s.clone())),
            JsonValue::Array(_) => Err(StorageError::Parameter(
                "JSON arrays cannot be bound as SQL arguments".into(),
            )),
            JsonValue::Object(_) => Err(StorageError::Parameter(
                "JSON objects cannot be bound as SQL arguments".into(),
            )),
        }
    }
}

/// SQL text with its positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub text: String,
    pub args: Vec<SqlValue>,
}

impl Query {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_args<I, V>(text: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        Self {
            text: text.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Append one positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<SqlValue>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Build a query whose arguments come from loosely typed JSON.
    ///
    /// # Errors
    /// Returns `StorageError::Parameter` for array or object arguments.
    pub fn from_json_args(
        text: impl Into<String>,
        args: &[JsonValue],
    ) -> Result<Self, StorageError> {
        let args = args
            .iter()
            .map(SqlValue::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            text: text.into(),
            args,
        })
    }

    pub(crate) fn ensure_text(&self) -> Result<(), StorageError> {
        if self.text.trim().is_empty() {
            return Err(StorageError::Parameter("query text is empty".into()));
        }
        Ok(())
    }
}

impl From<&str> for Query {
    fn from(text: &str) -> Self {
        Query::new(text)
    }
}

impl From<String> for Query {
    fn from(text: String) -> Self {
        Query::new(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn options_become_null() {
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some("x")), SqlValue::Text("x".into()));
    }

    #[test]
    fn json_scalars_convert() {
        let query = Query::from_json_args(
            "SELECT ?, ?, ?, ?, ?",
            &[json!(1), json!(2.5), json!("a"), json!(null), json!(true)],
        )
        .expect("scalars");
        assert_eq!(
            query.args,
            vec![
                SqlValue::Int64(1),
                SqlValue::Double(2.5),
                SqlValue::Text("a".into()),
                SqlValue::Null,
                SqlValue::Integer(1),
            ]
        );
    }

    #[test]
    fn json_containers_are_rejected() {
        let err = Query::from_json_args("SELECT ?", &[json!([1, 2])]).unwrap_err();
        assert!(matches!(err, StorageError::Parameter(_)));
        let err = SqlValue::try_from(&json!({"a": 1})).unwrap_err();
        assert!(matches!(err, StorageError::Parameter(_)));
    }

    #[test]
    fn empty_query_text_is_rejected() {
        assert!(Query::new("   ").ensure_text().is_err());
        assert!(Query::new("SELECT 1").ensure_text().is_ok());
    }
}
