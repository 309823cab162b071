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

//! Global tracing setup. Logs either go to stdout or to a configured file;
//! in the file case, [`recycle`] reopens the path so an external log
//! rotator (logrotate, etc.) can move the old file out from under us and
//! have the next line land in the replacement instead of the moved-away
//! inode. `bootstrap` wires this to `SIGUSR1`, matching the original
//! process's reopen-logs-on-SIGUSR1 convention.

use std::fs::{File, OpenOptions};
use std::io::{self, Write as _};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::errors::CreationError;

#[derive(Clone)]
enum Sink {
    Stdout,
    File(Arc<Mutex<File>>, PathBuf),
}

impl Sink {
    fn open(path: &str) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Sink::File(Arc::new(Mutex::new(file)), PathBuf::from(path)))
    }

    fn reopen(&self) -> io::Result<()> {
        if let Sink::File(slot, path) = self {
            let fresh = OpenOptions::new().create(true).append(true).open(path)?;
            *slot.lock().unwrap_or_else(|e| e.into_inner()) = fresh;
        }
        Ok(())
    }
}

pub struct LogWriter(Sink);

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.0 {
            Sink::Stdout => io::stdout().write(buf),
            Sink::File(slot, _) => slot.lock().unwrap_or_else(|e| e.into_inner()).write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &self.0 {
            Sink::Stdout => io::stdout().flush(),
            Sink::File(slot, _) => slot.lock().unwrap_or_else(|e| e.into_inner()).flush(),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Handle {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter(self.sink.clone())
    }
}

/// A handle retained by `bootstrap` so a signal handler can trigger
/// `recycle` without needing to reach back into the subscriber itself.
#[derive(Clone)]
pub struct Handle {
    sink: Sink,
}

impl Handle {
    /// Reopens the backing log file at its configured path. A no-op when
    /// logging to stdout.
    pub fn recycle(&self) -> io::Result<()> {
        self.sink.reopen()
    }
}

/// Installs the global tracing subscriber. Must be called exactly once,
/// before any other module starts logging.
pub fn init(config: &LoggingConfig) -> Result<Handle, CreationError> {
    let sink = match &config.path {
        Some(path) => Sink::open(path).map_err(CreationError::Io)?,
        None => Sink::Stdout,
    };
    let handle = Handle { sink };

    let filter = EnvFilter::try_new(&config.level)
        .map_err(|e| CreationError::InvalidValue { field: "logging.level", reason: e.to_string() })?;

    // A bare stdout stream is read by a human in a terminal; a file meant
    // to be shipped to a log aggregator is read by a parser, so the two
    // sinks get different event formatters entirely rather than sharing a
    // builder toggle.
    let result = match &handle.sink {
        Sink::File(..) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(handle.clone())
            .json()
            .try_init(),
        Sink::Stdout => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(handle.clone())
            .try_init(),
    };
    result.map_err(|e| CreationError::InvalidValue { field: "logging", reason: e.to_string() })?;

    Ok(handle)
}
