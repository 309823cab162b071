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

//! Process entry point. Owns initialization order: logging, then config, then
//! the scheduler/hub pair, then the signal-driven shutdown wait. Nothing
//! here is library surface — it exists to turn `cli::Args` into a running
//! process and a well-defined exit code.
//!
//! Exit codes: `0` on a clean shutdown with no signal recorded, the signal
//! number on a `SIGQUIT`/`SIGTERM` shutdown, `255` on a configuration or
//! argument error.

use std::collections::HashMap;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::Parser;

use evrt::backend::http::HttpFactory;
use evrt::backend::postgres::{self, PostgresFactory};
use evrt::backend::redis::{RedisOneShotFactory, RedisPubSubFactory};
use evrt::bootstrap;
use evrt::cli::Args;
use evrt::config::Config;
use evrt::device::DeviceFactory;
use evrt::gatekeeper::Gatekeeper;
use evrt::logging;
use evrt::pool::{Limits, ReuseLimits};
use evrt::queue::Consumer;
use evrt::request::Target;
use evrt::{Bridge, Hub, Scheduler};

const ARGUMENT_ERROR: i32 = 255;
const CONFIG_ERROR: i32 = 255;

fn parse_args() -> Args {
    match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => std::process::exit(0),
                _ => std::process::exit(ARGUMENT_ERROR),
            }
        }
    }
}

fn build_backends(config: &Config) -> Result<(HashMap<Target, Box<dyn DeviceFactory>>, HashMap<Target, Box<dyn DeviceFactory>>, Limits, ReuseLimits), evrt::errors::CreationError> {
    let mut one_shot: HashMap<Target, Box<dyn DeviceFactory>> = HashMap::new();
    let mut keep_alive: HashMap<Target, Box<dyn DeviceFactory>> = HashMap::new();
    let mut limits: Limits = HashMap::new();
    let mut reuse_limits: ReuseLimits = HashMap::new();

    if let Some(redis) = &config.redis {
        let url = redis.url();
        one_shot.insert(Target::KvCache, Box::new(RedisOneShotFactory { url: url.clone() }));
        keep_alive.insert(Target::KvCache, Box::new(RedisPubSubFactory { url }));
        limits.insert(Target::KvCache, redis.max_conn_per_worker);
    }

    if let Some(pg) = &config.postgres {
        postgres::validate_conn_string(&pg.conn_str)?;
        one_shot.insert(
            Target::Sql,
            Box::new(PostgresFactory {
                conn_string: pg.conn_str.clone(),
                statement_timeout: pg.statement_timeout(),
                post_connect_queries: pg.post_connect_queries.clone().into(),
            }),
        );
        limits.insert(Target::Sql, pg.max_conn_per_worker);
        reuse_limits.insert(Target::Sql, (pg.min_queries_per_conn, pg.max_queries_per_conn));
    }

    if let Some(http) = &config.http {
        let factory = HttpFactory::new(http.timeout())?;
        one_shot.insert(Target::Http, Box::new(factory));
        limits.insert(Target::Http, http.pool_limit);
    }

    Ok((one_shot, keep_alive, limits, reuse_limits))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = parse_args();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("failed to load configuration: {error}");
            std::process::exit(CONFIG_ERROR);
        }
    };

    let logging_handle = match logging::init(&config.logging) {
        Ok(handle) => handle,
        Err(error) => {
            eprintln!("failed to initialize logging: {error}");
            std::process::exit(CONFIG_ERROR);
        }
    };

    // A gatekeeper with no request-serving front end to call it is still
    // worth constructing here: a malformed rule (bad regex, unknown method)
    // fails the whole process at startup rather than surfacing only once an
    // embedding application's router happens to exercise that rule.
    if let Err(error) = Gatekeeper::load(&config.gatekeeper) {
        tracing::error!(%error, "invalid gatekeeper configuration");
        std::process::exit(CONFIG_ERROR);
    }

    let (one_shot_factories, keep_alive_factories, limits, reuse_limits) = match build_backends(&config) {
        Ok(backends) => backends,
        Err(error) => {
            tracing::error!(%error, "invalid backend configuration");
            std::process::exit(CONFIG_ERROR);
        }
    };

    let pid = std::process::id();
    let pid_file = config.pid_file_path(args.instance);
    let socket_path = config.inbox_socket_path(pid);

    let bridge = Bridge::new(&tokio::runtime::Handle::current());
    let hub = Hub::new(socket_path, one_shot_factories, keep_alive_factories, limits, reuse_limits, bridge.clone());
    let scheduler = Scheduler::new(hub.handle(), bridge.clone());

    let hub_scheduler = scheduler.clone();
    let hub_bridge = bridge.clone();
    let _hub_thread = hub.spawn(move |publication| {
        let scheduler = hub_scheduler.clone();
        hub_bridge.call_on_main_thread(Duration::ZERO, Box::new(move || scheduler.handle_publication(publication)));
    });

    if let Err(error) = bootstrap::write_pid_file(&pid_file) {
        tracing::error!(%error, path = %pid_file.display(), "failed to write pid file");
        std::process::exit(CONFIG_ERROR);
    }

    let shutdown = match bootstrap::install(scheduler.clone(), logging_handle) {
        Ok(shutdown) => shutdown,
        Err(error) => {
            tracing::error!(%error, "failed to install signal handlers");
            std::process::exit(CONFIG_ERROR);
        }
    };

    if let Some(beanstalkd) = config.beanstalkd.clone() {
        let consumer = Consumer::new(beanstalkd);
        let queue_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(error) = consumer.run(queue_shutdown).await {
                tracing::error!(%error, "beanstalkd consumer exited");
            }
        });
    }

    tracing::info!(instance = args.instance, cluster = args.cluster, pid, "evrtd started");
    shutdown.wait().await;

    // The pid file is operator-managed (§6): it stays on disk after a clean
    // shutdown for whatever supervised this process to inspect or clear.
    std::process::exit(shutdown.signal());
}
