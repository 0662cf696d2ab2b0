//! One worker's runtime: reactor, connection manager, signal watcher and
//! optional metrics exporter.
//!
//! A runtime is built inside the worker process after `fork`, owns everything
//! it touches, and lives on that process's only thread.

use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionManager, Service};
use crate::error::{Error, Result};
use crate::logging::LogContext;
use crate::net::SystemSockets;
use crate::reactor::Reactor;
use crate::signal::{self, SignalWatcher};

/// The per-worker runtime combining reactor and connection manager.
pub struct Runtime {
    /// Worker index, `0..workers`.
    id: usize,
    /// The event loop; every slot payload is a connection.
    reactor: Reactor<Connection>,
    /// Accept/read/write/timeout handlers.
    manager: Rc<ConnectionManager>,
    /// Bound on each multiplexer wait.
    max_wait: Option<Duration>,
}

impl Runtime {
    /// Builds the runtime for worker `id` serving `listener`.
    ///
    /// This creates the reactor on `mio`, registers the accept handler and a
    /// signal watcher (`SIGUSR2` stops the loop, `SIGUSR1` reopens logs), and
    /// starts a Prometheus exporter when `metrics_port` is configured.
    ///
    /// # Arguments
    ///
    /// * `id` - Worker index, used for logging and the metrics port offset
    /// * `config` - Validated server configuration
    /// * `listener` - Shared, non-blocking listening descriptor
    /// * `service` - Application logic run for each request
    /// * `logs` - This process's log destinations, reopened on `SIGUSR1`
    ///
    /// # Returns
    ///
    /// Returns `Ok(Runtime)` on success; any setup failure is returned and
    /// the worker should exit.
    pub fn new(
        id: usize,
        config: &ServerConfig,
        listener: RawFd,
        service: Rc<dyn Service>,
        logs: LogContext,
    ) -> Result<Self> {
        if let Some(base) = config.metrics_port {
            install_metrics(base, id)?;
        }

        let manager = ConnectionManager::new(
            listener,
            config.buffer_size,
            config.connection_settings(),
            service,
            Rc::new(SystemSockets),
        );
        let mut reactor = Reactor::with_mio(config.reactor_config(), |_| Connection::default())?;
        manager.listen(&mut reactor)?;

        let watcher = SignalWatcher::new(&signal::worker_signals(), move || logs.reopen())?;
        watcher.register(&mut reactor)?;

        Ok(Self::with_reactor(id, reactor, manager, config.max_wait()))
    }

    /// Wraps an already assembled reactor and manager.
    ///
    /// The manager's accept handler must already be registered.
    pub fn with_reactor(
        id: usize,
        reactor: Reactor<Connection>,
        manager: Rc<ConnectionManager>,
        max_wait: Option<Duration>,
    ) -> Self {
        Self {
            id,
            reactor,
            manager,
            max_wait,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn reactor_mut(&mut self) -> &mut Reactor<Connection> {
        &mut self.reactor
    }

    /// Stop flag of the underlying reactor; safe to set from another thread.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.reactor.stop_handle()
    }

    /// Runs the loop until stopped, then closes every remaining connection.
    pub fn run(mut self) {
        info!(worker = self.id, pid = std::process::id(), "worker running");

        self.reactor.run(self.max_wait);

        self.manager.unlisten(&mut self.reactor);
        self.manager.close_all(&mut self.reactor);

        info!(worker = self.id, "worker exiting");
    }
}

/// Starts the Prometheus listener for worker `id` on `base + id`.
fn install_metrics(base: u16, id: usize) -> Result<()> {
    let port = u16::try_from(id)
        .ok()
        .and_then(|id| base.checked_add(id))
        .ok_or_else(|| Error::Metrics(format!("port {base} + {id} out of range")))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener((Ipv4Addr::LOCALHOST, port))
        .install()
        .map_err(|e| Error::Metrics(e.to_string()))?;

    info!(worker = id, "metrics enabled at http://localhost:{port}/metrics");
    Ok(())
}
