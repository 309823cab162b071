// Copyright (c) 2018 Nuclear Furnace
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Helpers for SQL backends that are written to return exactly one `json`/
//! `jsonb` column per row (typically via `row_to_json(t)` or `json_agg(t)`
//! in the query itself). The caller never decodes asyncpg-style tuples
//! column by column; it gets back whatever JSON the query already shaped.

use bytes::Bytes;
use serde_json::Value;
use tokio_postgres::Row;

use crate::errors::DeviceError;
use crate::request::Request;

/// A request payload addressed to `backend::postgres` is the query text,
/// optionally followed by a `\n` and a JSON array of bind parameters. Most
/// callers have none, so the common case is just the SQL line by itself.
pub struct ParsedQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

pub fn parse_request(request: &Request) -> Result<ParsedQuery, DeviceError> {
    let text = std::str::from_utf8(request.payload()).map_err(|e| DeviceError::Protocol(format!("request payload not utf8: {e}")))?;
    match text.split_once('\n') {
        Some((sql, rest)) if !rest.trim().is_empty() => {
            let params: Vec<Value> = serde_json::from_str(rest.trim())
                .map_err(|e| DeviceError::Protocol(format!("bind parameter array is not valid json: {e}")))?;
            Ok(ParsedQuery { sql: sql.to_string(), params })
        }
        _ => Ok(ParsedQuery { sql: text.trim_end().to_string(), params: Vec::new() }),
    }
}

/// Builds the borrowed parameter slice `tokio_postgres` wants from our owned
/// `serde_json::Value`s. Every bind parameter is sent as `jsonb` and left to
/// Postgres to coerce, which is what lets one code path bind strings, numbers
/// and arrays alike without the caller needing to describe each column's type.
pub fn bind_params(params: &[Value]) -> Vec<&(dyn tokio_postgres::types::ToSql + Sync)> {
    params.iter().map(|v| v as &(dyn tokio_postgres::types::ToSql + Sync)).collect()
}

/// Decodes row 0 / column 0 of a query result as JSON and serializes it back
/// to bytes for an `Outcome`. Returns `null` (as `b"null"`) if the query
/// produced no rows, matching what `row_to_json` would have returned for an
/// empty result set wrapped in `json_agg`.
pub fn decode_single_column(rows: &[Row]) -> Result<Bytes, DeviceError> {
    let value: Value = match rows.first() {
        Some(row) => row
            .try_get::<_, Value>(0)
            .map_err(|e| DeviceError::Protocol(format!("expected a single json column: {e}")))?,
        None => Value::Null,
    };
    serde_json::to_vec(&value).map(Bytes::from).map_err(|e| DeviceError::Protocol(format!("failed to re-serialize json: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{LoggableContext, Mode, Target};

    fn request_with(payload: &str) -> Request {
        Request::new(Target::Sql, Mode::OneShot, LoggableContext::default(), Bytes::from(payload.to_string()))
    }

    #[test]
    fn parses_sql_without_params() {
        let parsed = parse_request(&request_with("select row_to_json(t) from t")).unwrap();
        assert_eq!(parsed.sql, "select row_to_json(t) from t");
        assert!(parsed.params.is_empty());
    }

    #[test]
    fn parses_sql_with_params() {
        let parsed = parse_request(&request_with("select row_to_json(t) from t where id = $1\n[42]")).unwrap();
        assert_eq!(parsed.sql, "select row_to_json(t) from t where id = $1");
        assert_eq!(parsed.params, vec![Value::from(42)]);
    }

    #[test]
    fn rejects_malformed_param_array() {
        assert!(parse_request(&request_with("select 1\nnot json")).is_err());
    }
}
