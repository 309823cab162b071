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

//! Outbound HTTP backend (`Target::Http`) on top of `reqwest`. One-shot
//! only, same as `backend::postgres`. A request's payload is a single
//! `METHOD URL` line, optionally followed by `\n` and a request body.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Method};

use crate::device::{ConnectionStatus, Device, DeviceFactory};
use crate::errors::{BackendError, DeviceError};
use crate::outcome::{DataObject, Outcome};
use crate::request::{LoggableContext, Request, Target};

fn parse_payload(request: &Request) -> Result<(Method, String, Option<Bytes>), DeviceError> {
    let payload = request.payload();
    let newline = payload.iter().position(|&b| b == b'\n');
    let (head, body) = match newline {
        Some(idx) => (&payload[..idx], Some(payload.slice(idx + 1..))),
        None => (&payload[..], None),
    };
    let head = std::str::from_utf8(head).map_err(|e| DeviceError::Protocol(format!("request payload not utf8: {e}")))?;
    let mut parts = head.split_whitespace();
    let method = parts.next().ok_or_else(|| DeviceError::Protocol("missing http method".into()))?;
    let url = parts.next().ok_or_else(|| DeviceError::Protocol("missing request url".into()))?.to_string();
    let method = method
        .parse::<Method>()
        .map_err(|_| DeviceError::Protocol(format!("unrecognized http method: {method}")))?;
    let body = body.filter(|b| !b.is_empty());
    Ok((method, url, body))
}

/// An outbound HTTP device holds no persistent connection of its own;
/// `reqwest::Client` already keeps a pooled `hyper` connection pool
/// internally and is cheap to clone, so "connect" here is really just
/// building that client once.
pub struct HttpDevice {
    client: Client,
    context: LoggableContext,
    status: ConnectionStatus,
    reusable: bool,
}

impl HttpDevice {
    pub fn new(client: Client, context: LoggableContext) -> Self {
        HttpDevice { client, context, status: ConnectionStatus::Disconnected, reusable: true }
    }
}

#[async_trait(?Send)]
impl Device for HttpDevice {
    fn context(&self) -> &LoggableContext { &self.context }

    async fn connect(&mut self) -> Result<ConnectionStatus, DeviceError> {
        self.status = ConnectionStatus::Connected;
        Ok(self.status)
    }

    async fn execute(&mut self, request: &Request) -> Result<Outcome, DeviceError> {
        let (method, url, body) = parse_payload(request)?;

        let span = request.context().span();
        let _enter = span.enter();

        let mut builder = self.client.request(method, &url);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status();
                let bytes = response.bytes().await.map_err(|e| DeviceError::Backend(e.to_string()))?;
                let mut outcome = Outcome::new(Target::Http);
                if status.is_success() {
                    outcome.attach(DataObject::Reply(bytes));
                } else {
                    outcome.attach(DataObject::Error(BackendError::with_code(
                        format!("http {status} from {url}"),
                        status.as_u16() as i32,
                    )));
                }
                Ok(outcome)
            }
            Err(e) => {
                self.reusable = false;
                self.status = ConnectionStatus::Error;
                let mut outcome = Outcome::new(Target::Http);
                outcome.attach(DataObject::Error(BackendError::new(e.to_string())));
                Ok(outcome)
            }
        }
    }

    fn is_reusable(&self) -> bool { self.reusable }

    fn invalidate_reuse(&mut self) { self.reusable = false; }

    fn status(&self) -> ConnectionStatus { self.status }
}

pub struct HttpFactory {
    client: Client,
}

impl HttpFactory {
    pub fn new(timeout: std::time::Duration) -> Result<Self, crate::errors::CreationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::errors::CreationError::InvalidValue { field: "http.client", reason: e.to_string() })?;
        Ok(HttpFactory { client })
    }
}

impl DeviceFactory for HttpFactory {
    fn create(&self, context: LoggableContext) -> Box<dyn Device> {
        Box::new(HttpDevice::new(self.client.clone(), context))
    }
}
