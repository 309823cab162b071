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

//! Beanstalkd work-queue consumer. Ported from
//! `ev::loop::beanstalkd::{Runner,Looper}` (`runner.cc`/`looper.cc`): a
//! dedicated reserve/consume/delete-or-bury loop, running independently of
//! the scheduler and hub, that hands each reserved job's body to whichever
//! [`Tube`] is registered for the tube named in the job's `"tube"` field.
//!
//! Unlike `Device`, a `Tube` never touches the inbox socket or the
//! scheduler — it runs on the ordinary multi-threaded runtime, not the
//! hub's `LocalSet`, so its trait is `Send` rather than `?Send`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::bootstrap::ShutdownHandle;
use crate::config::BeanstalkdConfig;
use crate::errors::QueueError;

/// What a [`Tube`] decided to do with a job it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Processing succeeded (or the job is a 404-equivalent no-op); delete it.
    Delete,
    /// Processing failed in a way a human should look at; bury it instead of
    /// deleting or silently retrying.
    Bury,
    /// Processing failed transiently; release it back to the tube after
    /// `delay_secs` so another reserve can pick it up.
    Release { delay_secs: u32 },
}

/// One registered job handler, keyed by tube name in the `Consumer`'s
/// registry. Mirrors `Job::Factory`/`Consumer::Consume` from the original:
/// a single dispatch point per tube, looked up once per reserved job.
#[async_trait]
pub trait Tube: Send + Sync {
    async fn consume(&self, job_id: u64, payload: Value) -> JobOutcome;
}

/// A reserved job as read off the wire: the id beanstalkd assigned it and
/// its raw body.
struct ReservedJob {
    id: u64,
    body: Vec<u8>,
}

/// Minimal async client for the subset of the beanstalkd ASCII protocol this
/// runtime needs: `watch`/`ignore`/`reserve-with-timeout`/`delete`/`bury`/
/// `release`. Hand-rolled the same way `backend::redis` hand-rolls RESP
/// command construction, since beanstalkd's wire format is no more than a
/// handful of newline-terminated command lines and one length-prefixed body.
struct Wire {
    stream: BufReader<TcpStream>,
}

impl Wire {
    async fn connect(config: &BeanstalkdConfig) -> Result<Self, QueueError> {
        let stream = TcpStream::connect(config.address()).await?;
        Ok(Wire { stream: BufReader::new(stream) })
    }

    async fn write_line(&mut self, line: &str) -> Result<(), QueueError> {
        self.stream.get_mut().write_all(line.as_bytes()).await?;
        self.stream.get_mut().write_all(b"\r\n").await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, QueueError> {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await?;
        if n == 0 {
            return Err(QueueError::Protocol("connection closed by beanstalkd".into()));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn read_exact_body(&mut self, len: usize) -> Result<Vec<u8>, QueueError> {
        let mut body = vec![0u8; len];
        tokio::io::AsyncReadExt::read_exact(&mut self.stream, &mut body).await?;
        // Every body on the wire is followed by a trailing CRLF.
        let mut crlf = [0u8; 2];
        tokio::io::AsyncReadExt::read_exact(&mut self.stream, &mut crlf).await?;
        Ok(body)
    }

    async fn watch(&mut self, tube: &str) -> Result<(), QueueError> {
        self.write_line(&format!("watch {tube}")).await?;
        let reply = self.read_line().await?;
        if reply.starts_with("WATCHING ") {
            Ok(())
        } else {
            Err(QueueError::Protocol(format!("watch {tube}: {reply}")))
        }
    }

    async fn ignore(&mut self, tube: &str) -> Result<(), QueueError> {
        self.write_line(&format!("ignore {tube}")).await?;
        let reply = self.read_line().await?;
        // NOT_IGNORED is returned when this is the last watched tube; that's
        // not an error, just a no-op we don't need to retry.
        if reply.starts_with("WATCHING ") || reply == "NOT_IGNORED" {
            Ok(())
        } else {
            Err(QueueError::Protocol(format!("ignore {tube}: {reply}")))
        }
    }

    /// `reserve-with-timeout` bounds how long this call blocks so the
    /// consumer loop can still notice a shutdown signal between reserves.
    /// Returns `None` on `TIMED_OUT`/`DEADLINE_SOON` rather than erroring —
    /// both just mean "nothing to do yet".
    async fn reserve_with_timeout(&mut self, secs: u64) -> Result<Option<ReservedJob>, QueueError> {
        self.write_line(&format!("reserve-with-timeout {secs}")).await?;
        let reply = self.read_line().await?;
        if reply == "TIMED_OUT" || reply == "DEADLINE_SOON" {
            return Ok(None);
        }
        let Some(rest) = reply.strip_prefix("RESERVED ") else {
            return Err(QueueError::Protocol(format!("reserve: {reply}")));
        };
        let mut parts = rest.split_whitespace();
        let id: u64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| QueueError::Protocol(format!("reserve: malformed id in {reply}")))?;
        let len: usize = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| QueueError::Protocol(format!("reserve: malformed length in {reply}")))?;
        let body = self.read_exact_body(len).await?;
        Ok(Some(ReservedJob { id, body }))
    }

    async fn delete(&mut self, id: u64) -> Result<(), QueueError> {
        self.write_line(&format!("delete {id}")).await?;
        let reply = self.read_line().await?;
        if reply == "DELETED" {
            Ok(())
        } else {
            Err(QueueError::Protocol(format!("delete {id}: {reply}")))
        }
    }

    async fn bury(&mut self, id: u64, priority: u32) -> Result<(), QueueError> {
        self.write_line(&format!("bury {id} {priority}")).await?;
        let reply = self.read_line().await?;
        if reply == "BURIED" {
            Ok(())
        } else {
            Err(QueueError::Protocol(format!("bury {id}: {reply}")))
        }
    }

    async fn release(&mut self, id: u64, priority: u32, delay_secs: u32) -> Result<(), QueueError> {
        self.write_line(&format!("release {id} {priority} {delay_secs}")).await?;
        let reply = self.read_line().await?;
        if reply == "RELEASED" {
            Ok(())
        } else {
            Err(QueueError::Protocol(format!("release {id}: {reply}")))
        }
    }
}

const DEFAULT_PRIORITY: u32 = 1024;
const RESERVE_POLL_SECS: u64 = 5;

/// Owns the beanstalkd connection and the tube registry. Built once at
/// startup from [`BeanstalkdConfig`] and run for the life of the process,
/// mirroring `Runner`'s consumer thread in the original — here it's just
/// another task on the main runtime rather than a dedicated OS thread,
/// since it has no shared mutable state with the scheduler or hub to
/// protect.
pub struct Consumer {
    config: BeanstalkdConfig,
    tubes: HashMap<String, Arc<dyn Tube>>,
}

impl Consumer {
    pub fn new(config: BeanstalkdConfig) -> Self {
        Consumer { config, tubes: HashMap::new() }
    }

    /// Registers a handler for `tube`. Jobs reserved with a `"tube"` field
    /// that has no registered handler are buried rather than crashing the
    /// consumer loop — an unregistered tube is an operator misconfiguration,
    /// not a reason to take the whole process down.
    pub fn register(&mut self, tube: impl Into<String>, handler: Arc<dyn Tube>) {
        self.tubes.insert(tube.into(), handler);
    }

    /// Runs the reserve/consume/delete-or-bury loop until `shutdown` fires.
    /// Reconnects are not attempted here; a connection failure is returned
    /// to the caller, which mirrors the original only ever connecting once
    /// per process lifetime (a crashed consumer thread was restarted by
    /// whatever supervised the whole process, not by the runner itself).
    pub async fn run(mut self, shutdown: ShutdownHandle) -> Result<(), QueueError> {
        let mut wire = Wire::connect(&self.config).await?;

        for tube in &self.config.tubes {
            wire.watch(tube).await?;
        }
        if !self.config.tubes.iter().any(|t| t == "default") {
            wire.ignore("default").await?;
        }

        tracing::info!(tubes = ?self.config.tubes, "beanstalkd consumer watching tubes");

        loop {
            let reserved = tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    tracing::info!("beanstalkd consumer shutting down");
                    return Ok(());
                }
                result = wire.reserve_with_timeout(RESERVE_POLL_SECS) => result?,
            };

            let Some(job) = reserved else { continue };
            self.process(&mut wire, job).await;
        }
    }

    async fn process(&mut self, wire: &mut Wire, job: ReservedJob) {
        let outcome = match self.dispatch(&job).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(job_id = job.id, %error, "failed to process queued job");
                JobOutcome::Bury
            }
        };

        let result = match outcome {
            JobOutcome::Delete => wire.delete(job.id).await,
            JobOutcome::Bury => wire.bury(job.id, DEFAULT_PRIORITY).await,
            JobOutcome::Release { delay_secs } => wire.release(job.id, DEFAULT_PRIORITY, delay_secs).await,
        };

        if let Err(error) = result {
            tracing::error!(job_id = job.id, ?outcome, %error, "failed to settle queued job");
        }
    }

    async fn dispatch(&self, job: &ReservedJob) -> Result<JobOutcome, QueueError> {
        let payload: Value = serde_json::from_slice(&job.body)?;
        let tube = payload.get("tube").and_then(Value::as_str).ok_or_else(|| {
            QueueError::Protocol(format!("job {} has no string \"tube\" field", job.id))
        })?;

        let Some(handler) = self.tubes.get(tube).cloned() else {
            tracing::error!(job_id = job.id, tube, "job tube is not registered");
            return Ok(JobOutcome::Bury);
        };

        tracing::info!(job_id = job.id, tube, "processing queued job");
        Ok(handler.consume(job.id, payload).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpListener as StdTcpListener;

    fn config(port: u16, tubes: Vec<&str>) -> BeanstalkdConfig {
        BeanstalkdConfig {
            host: "127.0.0.1".to_string(),
            port,
            timeout: 5.0,
            tubes: tubes.into_iter().map(String::from).collect(),
        }
    }

    #[tokio::test]
    async fn watch_and_reserve_round_trip() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut reader = std::io::BufReader::new(socket.try_clone().unwrap());

            let mut line = String::new();
            std::io::BufRead::read_line(&mut reader, &mut line).unwrap();
            assert_eq!(line.trim_end(), "watch jobs");
            socket.write_all(b"WATCHING 2\r\n").unwrap();

            line.clear();
            std::io::BufRead::read_line(&mut reader, &mut line).unwrap();
            assert_eq!(line.trim_end(), "ignore default");
            socket.write_all(b"WATCHING 1\r\n").unwrap();

            line.clear();
            std::io::BufRead::read_line(&mut reader, &mut line).unwrap();
            assert_eq!(line.trim_end(), "reserve-with-timeout 5");
            let body = b"{\"tube\":\"jobs\"}";
            socket.write_all(format!("RESERVED 42 {}\r\n", body.len()).as_bytes()).unwrap();
            socket.write_all(body).unwrap();
            socket.write_all(b"\r\n").unwrap();

            line.clear();
            std::io::BufRead::read_line(&mut reader, &mut line).unwrap();
            assert_eq!(line.trim_end(), "delete 42");
            socket.write_all(b"DELETED\r\n").unwrap();
        });

        let mut wire = Wire::connect(&config(addr.port(), vec![])).await.unwrap();
        wire.watch("jobs").await.unwrap();
        wire.ignore("default").await.unwrap();
        let job = wire.reserve_with_timeout(5).await.unwrap().unwrap();
        assert_eq!(job.id, 42);
        assert_eq!(job.body, b"{\"tube\":\"jobs\"}");
        wire.delete(job.id).await.unwrap();

        server.join().unwrap();
    }

    struct RecordingTube {
        outcome: JobOutcome,
    }

    #[async_trait]
    impl Tube for RecordingTube {
        async fn consume(&self, _job_id: u64, _payload: Value) -> JobOutcome {
            self.outcome
        }
    }

    #[tokio::test]
    async fn dispatch_buries_job_for_unregistered_tube() {
        let consumer = Consumer::new(config(0, vec!["jobs"]));
        let job = ReservedJob { id: 7, body: br#"{"tube":"unknown"}"#.to_vec() };
        let outcome = consumer.dispatch(&job).await.unwrap();
        assert_eq!(outcome, JobOutcome::Bury);
    }

    #[tokio::test]
    async fn dispatch_rejects_payload_without_tube_field() {
        let consumer = Consumer::new(config(0, vec!["jobs"]));
        let job = ReservedJob { id: 8, body: br#"{"foo":"bar"}"#.to_vec() };
        assert!(consumer.dispatch(&job).await.is_err());
    }

    #[tokio::test]
    async fn dispatch_routes_to_registered_tube() {
        let mut consumer = Consumer::new(config(0, vec!["jobs"]));
        consumer.register("jobs", Arc::new(RecordingTube { outcome: JobOutcome::Delete }));
        let job = ReservedJob { id: 9, body: br#"{"tube":"jobs"}"#.to_vec() };
        let outcome = consumer.dispatch(&job).await.unwrap();
        assert_eq!(outcome, JobOutcome::Delete);
    }
}
