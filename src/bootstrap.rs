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

//! Process-level plumbing: pid file, and the common signal set every
//! deployment of this runtime wants handled the same way. Ported from
//! `ev::Signals` (`signals.cc`): `SIGUSR1` recycles logs, `SIGTTIN`
//! invalidates pooled PostgreSQL connections by pushing a one-shot
//! `Target::Sql` task with `Control::Invalidate`, and `SIGQUIT`/`SIGTERM`
//! both mean "shut down cleanly". Signal numbers not in that set are left
//! alone rather than terminating the process by default, since `signal_hook`
//! already took over their default disposition the moment it registered
//! any handler at all.
//!
//! The pid file itself is operator-managed: nothing in this module removes
//! it on shutdown, clean or otherwise. Whatever put it there (an init
//! script, a process supervisor) is responsible for clearing it too.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use futures_util::stream::StreamExt;
use signal_hook::consts::{SIGQUIT, SIGTERM, SIGTTIN, SIGUSR1};
use signal_hook_tokio::Signals;
use tokio::sync::Notify;

use crate::logging;
use crate::request::{Control, LoggableContext, Mode, Request, Target};
use crate::scheduler::Scheduler;
use crate::task::{StepResult, TaskBuilder};

/// Writes `pid` (the current process) to `path`, truncating any existing
/// file. Nothing in this crate ever removes it again — the OS doesn't clean
/// this up on its own the way it does the inbox socket, and per §6 that's
/// intentional: clearing it is the operator's job, not the runtime's.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))
}

/// Signals that a clean shutdown was requested (`SIGQUIT`/`SIGTERM`).
/// `main` awaits this alongside its own request-serving loop.
#[derive(Clone)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
    signal: Arc<AtomicI32>,
}

impl ShutdownHandle {
    pub async fn wait(&self) {
        self.notify.notified().await
    }

    /// The signal number that triggered shutdown, once `wait` has returned.
    /// Callers use this as the process exit code, matching §6's
    /// "`SIGQUIT`-value on signal shutdown" convention.
    pub fn signal(&self) -> i32 {
        self.signal.load(Ordering::SeqCst)
    }
}

/// Spawns the signal-handling task on the current (main-thread) runtime.
/// Returns a handle the caller awaits for a clean-shutdown request; the
/// signal task itself runs for the life of the process.
pub fn install(scheduler: Scheduler, logging: logging::Handle) -> io::Result<ShutdownHandle> {
    let mut signals = Signals::new([SIGUSR1, SIGTTIN, SIGQUIT, SIGTERM])?;
    let notify = Arc::new(Notify::new());
    let signal_no = Arc::new(AtomicI32::new(0));
    let shutdown = ShutdownHandle { notify: notify.clone(), signal: signal_no.clone() };

    tokio::spawn(async move {
        while let Some(signal) = signals.next().await {
            match signal {
                SIGUSR1 => {
                    tracing::info!(signal, "recycling logs");
                    if let Err(error) = logging.recycle() {
                        tracing::error!(%error, "failed to recycle log file");
                    }
                }
                SIGTTIN => {
                    tracing::info!(signal, "invalidating pooled sql connections");
                    invalidate_sql_pool(&scheduler);
                }
                SIGQUIT | SIGTERM => {
                    tracing::info!(signal, "clean shutdown requested");
                    signal_no.store(signal, Ordering::SeqCst);
                    notify.notify_waiters();
                }
                other => {
                    tracing::warn!(signal = other, "received unhandled signal");
                }
            }
        }
    });

    Ok(shutdown)
}

/// Equivalent to the original's `SIGTTIN` branch: push a synthetic
/// `Control::Invalidate` request so no subsequent one-shot `Sql` request
/// reuses a connection that predates whatever prompted the operator to send
/// the signal (typically a credential rotation or a failover).
fn invalidate_sql_pool(scheduler: &Scheduler) {
    let context = LoggableContext::new("bootstrap", "sigttin");
    scheduler.register(0);
    let request = Request::new(Target::Sql, Mode::OneShot, context, bytes::Bytes::new()).with_control(Control::Invalidate);
    let task = TaskBuilder::new(request)
        .finally(|result| match result {
            Ok(_) => tracing::info!("sql connection pool invalidated"),
            Err(error) => tracing::error!(%error, "failed to invalidate sql connection pool"),
        })
        .catch(|_error| StepResult::Done);

    if let Err(error) = scheduler.push(0, Box::new(task)) {
        tracing::error!(%error, "failed to schedule sql pool invalidation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_pid_file_with_the_current_process_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evrt.pid");
        write_pid_file(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn write_pid_file_truncates_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evrt.pid");
        std::fs::write(&path, "99999999\nstale\n").unwrap();
        write_pid_file(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }
}
