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

//! SQL backend (`Target::Sql`) on top of `tokio_postgres`. One-shot only —
//! nothing in the runtime subscribes to Postgres, so there's no keep-alive
//! counterpart to this module the way `backend::redis` has one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::NoTls;

use crate::device::{ConnectionStatus, Device, DeviceFactory};
use crate::errors::{BackendError, CreationError, DeviceError};
use crate::json_sql;
use crate::outcome::{DataObject, Outcome};
use crate::request::{LoggableContext, Request, Target};

pub struct PostgresDevice {
    conn_string: String,
    statement_timeout: Duration,
    post_connect_queries: Arc<[String]>,
    client: Option<tokio_postgres::Client>,
    context: LoggableContext,
    status: ConnectionStatus,
    reusable: bool,
}

impl PostgresDevice {
    pub fn new(conn_string: impl Into<String>, statement_timeout: Duration, post_connect_queries: Arc<[String]>, context: LoggableContext) -> Self {
        PostgresDevice {
            conn_string: conn_string.into(),
            statement_timeout,
            post_connect_queries,
            client: None,
            context,
            status: ConnectionStatus::Disconnected,
            reusable: true,
        }
    }
}

#[async_trait(?Send)]
impl Device for PostgresDevice {
    fn context(&self) -> &LoggableContext { &self.context }

    async fn connect(&mut self) -> Result<ConnectionStatus, DeviceError> {
        let (client, connection) = tokio_postgres::connect(&self.conn_string, NoTls)
            .await
            .map_err(|e| DeviceError::Backend(e.to_string()))?;

        // The connection object drives the actual socket I/O; it has to be
        // polled continuously even though nothing ever calls a method on it
        // directly, or every query against `client` would simply hang.
        tokio::task::spawn_local(async move {
            if let Err(error) = connection.await {
                tracing::warn!(%error, "postgres connection task exited");
            }
        });

        client
            .batch_execute(&format!("SET statement_timeout = {}", self.statement_timeout.as_millis()))
            .await
            .map_err(|e| DeviceError::Backend(format!("failed to set statement_timeout: {e}")))?;

        for query in self.post_connect_queries.iter() {
            client
                .batch_execute(query)
                .await
                .map_err(|e| DeviceError::Backend(format!("post-connect query {query:?} failed: {e}")))?;
        }

        self.client = Some(client);
        self.status = ConnectionStatus::Connected;
        Ok(self.status)
    }

    async fn execute(&mut self, request: &Request) -> Result<Outcome, DeviceError> {
        let client = self.client.as_ref().ok_or(DeviceError::Disconnected)?;
        let parsed = json_sql::parse_request(request)?;
        let params = json_sql::bind_params(&parsed.params);

        let span = request.context().span();
        let _enter = span.enter();

        match client.query(parsed.sql.as_str(), &params).await {
            Ok(rows) => {
                let json = json_sql::decode_single_column(&rows)?;
                Ok(Outcome::single(Target::Sql, DataObject::Reply(json)))
            }
            Err(e) => {
                self.reusable = false;
                self.status = ConnectionStatus::Error;
                let mut outcome = Outcome::new(Target::Sql);
                let code = e.code().and_then(|c| c.code().parse::<i32>().ok());
                outcome.attach(DataObject::Error(match code {
                    Some(code) => BackendError::with_code(e.to_string(), code),
                    None => BackendError::new(e.to_string()),
                }));
                Ok(outcome)
            }
        }
    }

    fn is_reusable(&self) -> bool {
        self.reusable && self.client.as_ref().map(|c| !c.is_closed()).unwrap_or(false)
    }

    fn invalidate_reuse(&mut self) { self.reusable = false; }

    fn status(&self) -> ConnectionStatus { self.status }
}

pub struct PostgresFactory {
    pub conn_string: String,
    pub statement_timeout: Duration,
    pub post_connect_queries: Arc<[String]>,
}

impl DeviceFactory for PostgresFactory {
    fn create(&self, context: LoggableContext) -> Box<dyn Device> {
        Box::new(PostgresDevice::new(self.conn_string.clone(), self.statement_timeout, self.post_connect_queries.clone(), context))
    }
}

/// Validates a connection string eagerly at config-load time so a typo
/// surfaces before the hub thread ever starts, rather than as a stream of
/// per-request connect failures once traffic starts flowing.
pub fn validate_conn_string(conn_string: &str) -> Result<(), CreationError> {
    conn_string
        .parse::<tokio_postgres::Config>()
        .map(|_| ())
        .map_err(|e| CreationError::InvalidValue { field: "postgres.url", reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_conn_string() {
        assert!(validate_conn_string("not a postgres url").is_err());
    }

    #[test]
    fn accepts_well_formed_conn_string() {
        assert!(validate_conn_string("host=localhost user=postgres dbname=evrt").is_ok());
    }
}
