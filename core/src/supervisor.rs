//! Tunnel lifecycle supervision.
//!
//! A [`TunnelSupervisor`] owns at most one `cloudflared` process for one
//! [`TunnelSpec`]. It starts and stops the process, watches its output,
//! and reconciles periodically: a process that died without `stop()` is
//! recorded as an error and restarted, at most once per cooldown window.
//!
//! ```text
//!   Stopped ──start()──► (Starting) ──first line ok──► Running
//!                              │                          │ crash
//!                              └──first line error──► Error ◄┘
//!   Error ──reconcile, cooldown elapsed──► (Starting) ──► Running
//!   any ──stop()──► Stopped
//! ```
//!
//! `start()`, `stop()` and reconciliation are serialized through one async
//! mutex around the process slot, so two processes can never coexist.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{SpecError, StartError};
use crate::output::{LineClass, OutputMonitor, OutputSignal, UNEXPECTED_TERMINATION};
use crate::platform::{ExecutableProvider, PortProbe, PortReaper};
use crate::probe::SystemPorts;
use crate::process::{DEFAULT_GRACE, ProcessHandle, format_exit_status};
use crate::status::{StatusBroadcaster, StatusListener, SubscriptionId, TunnelStatus};

/// One logical tunnel: a public hostname mapped to a local port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    hostname: String,
    local_port: u16,
    auth_token: Option<String>,
}

impl TunnelSpec {
    /// Validates and builds a spec. A blank token counts as no token.
    pub fn new(
        hostname: impl Into<String>,
        local_port: u16,
        auth_token: Option<String>,
    ) -> Result<Self, SpecError> {
        let hostname = hostname.into().trim().to_string();
        if hostname.is_empty() {
            return Err(SpecError::EmptyHostname);
        }
        if local_port == 0 {
            return Err(SpecError::InvalidPort);
        }
        let auth_token = auth_token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Ok(Self {
            hostname,
            local_port,
            auth_token,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn is_protected(&self) -> bool {
        self.auth_token.is_some()
    }

    /// Arguments passed to `cloudflared`.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![
            "access".to_string(),
            "tcp".to_string(),
            "--hostname".to_string(),
            self.hostname.clone(),
            "--url".to_string(),
            format!("localhost:{}", self.local_port),
        ];
        if let Some(token) = &self.auth_token {
            args.push("--service-token-id".to_string());
            args.push(token.clone());
        }
        args
    }
}

/// Timing and retry knobs of a supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub reconcile_interval: Duration,
    pub restart_cooldown: Duration,
    pub stop_grace: Duration,
    /// How long `start()` waits for the first output line.
    pub startup_probe: Duration,
    pub spawn_attempts: u32,
    pub spawn_retry_delay: Duration,
    pub clear_port_on_stop: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            restart_cooldown: Duration::from_secs(300),
            stop_grace: DEFAULT_GRACE,
            startup_probe: Duration::from_secs(3),
            spawn_attempts: 3,
            spawn_retry_delay: Duration::from_secs(2),
            clear_port_on_stop: true,
        }
    }
}

/// Builder for [`TunnelSupervisor`]. Port handling defaults to [`SystemPorts`].
pub struct SupervisorBuilder {
    spec: TunnelSpec,
    provider: Arc<dyn ExecutableProvider>,
    settings: SupervisorSettings,
    probe: Option<Arc<dyn PortProbe>>,
    reaper: Option<Arc<dyn PortReaper>>,
    path_env: Option<String>,
}

impl SupervisorBuilder {
    pub fn settings(mut self, settings: SupervisorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn port_probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn port_reaper(mut self, reaper: Arc<dyn PortReaper>) -> Self {
        self.reaper = Some(reaper);
        self
    }

    /// `PATH` given to the tunnel process.
    pub fn path_env(mut self, path: impl Into<String>) -> Self {
        self.path_env = Some(path.into());
        self
    }

    pub fn build(self) -> TunnelSupervisor {
        let ports = Arc::new(SystemPorts::default());
        let probe: Arc<dyn PortProbe> = match self.probe {
            Some(probe) => probe,
            None => ports.clone(),
        };
        let reaper: Arc<dyn PortReaper> = match self.reaper {
            Some(reaper) => reaper,
            None => ports,
        };

        TunnelSupervisor {
            inner: Arc::new(Inner {
                spec: self.spec,
                settings: self.settings,
                provider: self.provider,
                probe,
                reaper,
                path_env: self.path_env,
                status: StatusBroadcaster::new(),
                slot: tokio::sync::Mutex::new(Slot::default()),
                generation: AtomicU64::new(0),
                stop_requested: AtomicBool::new(false),
                auth_blocked: AtomicBool::new(false),
                starting: AtomicBool::new(false),
                spawn_count: AtomicU64::new(0),
                last_restart: Mutex::new(None),
            }),
        }
    }
}

/// Supervises one tunnel. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TunnelSupervisor {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Slot {
    process: Option<ProcessHandle>,
    monitor: Option<JoinHandle<()>>,
    reconciler: Option<JoinHandle<()>>,
}

struct Inner {
    spec: TunnelSpec,
    settings: SupervisorSettings,
    provider: Arc<dyn ExecutableProvider>,
    probe: Arc<dyn PortProbe>,
    reaper: Arc<dyn PortReaper>,
    path_env: Option<String>,
    status: StatusBroadcaster,
    slot: tokio::sync::Mutex<Slot>,
    /// Bumped for every launch and stop; output signals from older
    /// processes are discarded.
    generation: AtomicU64,
    stop_requested: AtomicBool,
    /// Set by a token failure; cleared only by an explicit `start()`.
    auth_blocked: AtomicBool,
    starting: AtomicBool,
    spawn_count: AtomicU64,
    last_restart: Mutex<Option<DateTime<Utc>>>,
}

impl TunnelSupervisor {
    pub fn builder(spec: TunnelSpec, provider: Arc<dyn ExecutableProvider>) -> SupervisorBuilder {
        SupervisorBuilder {
            spec,
            provider,
            settings: SupervisorSettings::default(),
            probe: None,
            reaper: None,
            path_env: None,
        }
    }

    pub fn new(spec: TunnelSpec, provider: Arc<dyn ExecutableProvider>) -> Self {
        Self::builder(spec, provider).build()
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.inner.spec
    }

    pub fn hostname(&self) -> &str {
        self.inner.spec.hostname()
    }

    pub fn port(&self) -> u16 {
        self.inner.spec.local_port()
    }

    pub fn is_protected(&self) -> bool {
        self.inner.spec.is_protected()
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    pub fn status(&self) -> TunnelStatus {
        self.inner.status.current()
    }

    /// `stopped`, `running`, or `error: <message>`.
    pub fn status_string(&self) -> String {
        self.status().to_string()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.status.last_error()
    }

    /// True while a launch is in flight.
    pub fn is_starting(&self) -> bool {
        self.inner.starting.load(Ordering::Acquire)
    }

    /// Time of the last automatic restart, if any.
    pub fn last_restart(&self) -> Option<DateTime<Utc>> {
        *self
            .inner
            .last_restart
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// "never", or a relative description such as "3 minutes ago".
    pub fn last_restart_description(&self) -> String {
        format_last_restart(self.last_restart())
    }

    /// Number of processes spawned over the supervisor's lifetime.
    pub fn spawn_count(&self) -> u64 {
        self.inner.spawn_count.load(Ordering::Acquire)
    }

    /// Pid of the current process, if one is held.
    pub async fn pid(&self) -> Option<u32> {
        let slot = self.inner.slot.lock().await;
        slot.process.as_ref().and_then(ProcessHandle::pid)
    }

    /// Whether the held process is alive right now.
    pub async fn is_process_alive(&self) -> bool {
        let mut slot = self.inner.slot.lock().await;
        slot.process.as_mut().is_some_and(ProcessHandle::is_alive)
    }

    /// Registers a status listener.
    ///
    /// # Panics
    ///
    /// Panics outside a tokio runtime, since each listener gets its own
    /// delivery task.
    pub fn subscribe_status(&self, listener: Arc<dyn StatusListener>) -> SubscriptionId {
        self.inner.status.subscribe(listener)
    }

    pub fn unsubscribe_status(&self, id: SubscriptionId) {
        self.inner.status.unsubscribe(id)
    }

    /// Starts the tunnel. A no-op while the process is alive.
    ///
    /// An explicit start also lifts the block placed by an authentication failure.
    pub async fn start(&self) -> Result<(), StartError> {
        let mut slot = self.inner.slot.lock().await;
        self.inner.stop_requested.store(false, Ordering::Release);
        self.inner.auth_blocked.store(false, Ordering::Release);
        self.inner.start_locked(&mut slot).await
    }

    /// Stops the tunnel and leaves it `Stopped`, whatever the prior state.
    pub async fn stop(&self) {
        let mut slot = self.inner.slot.lock().await;
        self.inner.stop_requested.store(true, Ordering::Release);
        self.inner.stop_locked(&mut slot).await;
    }

    /// Runs one reconciliation pass now, as the periodic timer would.
    pub async fn reconcile(&self) {
        self.inner.reconcile().await;
    }

    /// Stops the tunnel and detaches every status subscriber.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.inner.status.close();
    }
}

impl Inner {
    async fn start_locked(self: &Arc<Self>, slot: &mut Slot) -> Result<(), StartError> {
        if let Some(process) = slot.process.as_mut()
            && process.is_alive()
        {
            debug!("Tunnel for {} already running", self.spec.hostname);
            return Ok(());
        }
        if let Some(stale) = slot.process.take() {
            self.discard(stale).await;
        }
        if let Some(monitor) = slot.monitor.take() {
            monitor.abort();
        }

        self.starting.store(true, Ordering::Release);
        let launched = self.launch(slot).await;
        self.starting.store(false, Ordering::Release);

        if let Err(e) = &launched {
            if e.is_authentication() {
                self.auth_blocked.store(true, Ordering::Release);
            }
            error!(
                "Failed to start tunnel for {}:{} [{}]: {}",
                self.spec.hostname,
                self.spec.local_port,
                e.as_label(),
                e
            );
            self.status.set_status(TunnelStatus::error(e.status_message()));
        }
        launched
    }

    async fn launch(self: &Arc<Self>, slot: &mut Slot) -> Result<(), StartError> {
        let executable = self.provider.ensure_executable().await?;
        let mut process = self.spawn_with_retry(&executable).await?;

        let mut monitor = match OutputMonitor::attach(&mut process) {
            Ok(monitor) => monitor,
            Err(source) => {
                self.discard(process).await;
                return Err(StartError::Spawn {
                    attempts: 1,
                    source,
                });
            }
        };

        match tokio::time::timeout(self.settings.startup_probe, monitor.next_line()).await {
            Ok(Ok(Some(line))) => match line.class {
                LineClass::Error => {
                    self.discard(process).await;
                    return Err(StartError::Rejected {
                        message: line.message,
                    });
                }
                LineClass::AuthenticationFailure => {
                    self.discard(process).await;
                    return Err(StartError::Authentication {
                        message: line.message,
                    });
                }
                LineClass::Info | LineClass::Warning => {
                    debug!("First tunnel output looks healthy: {}", line.raw);
                }
            },
            Ok(Ok(None)) => {
                let status = match process.terminate(self.settings.stop_grace).await {
                    Ok(status) => format_exit_status(status),
                    Err(e) => e.to_string(),
                };
                return Err(StartError::ExitedEarly { status });
            }
            Ok(Err(e)) => warn!("Could not read initial tunnel output: {}", e),
            Err(_) => debug!(
                "No tunnel output within {:?}; assuming it is up",
                self.settings.startup_probe
            ),
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        slot.process = Some(process);
        self.status.set_status(TunnelStatus::Running);
        slot.monitor = Some(self.spawn_monitor(monitor, generation));
        if slot.reconciler.as_ref().is_none_or(JoinHandle::is_finished) {
            slot.reconciler = Some(self.spawn_reconciler());
        }

        info!(
            "Started cloudflared tunnel for {}:{}{}",
            self.spec.hostname,
            self.spec.local_port,
            if self.spec.is_protected() {
                " (protected)"
            } else {
                ""
            }
        );
        Ok(())
    }

    async fn spawn_with_retry(&self, executable: &Path) -> Result<ProcessHandle, StartError> {
        let args = self.spec.command_args();
        let attempts = self.settings.spawn_attempts.max(1);
        let mut attempt = 1;

        loop {
            match ProcessHandle::spawn(executable, &args, self.path_env.as_deref()) {
                Ok(process) => {
                    self.spawn_count.fetch_add(1, Ordering::AcqRel);
                    return Ok(process);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        "Spawn attempt {}/{} failed ({}), retrying in {:?}",
                        attempt, attempts, e, self.settings.spawn_retry_delay
                    );
                    tokio::time::sleep(self.settings.spawn_retry_delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(StartError::Spawn {
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }

    async fn discard(&self, process: ProcessHandle) {
        if let Err(e) = process.terminate(self.settings.stop_grace).await {
            warn!("Failed to reap rejected tunnel process: {}", e);
        }
    }

    async fn stop_locked(&self, slot: &mut Slot) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(reconciler) = slot.reconciler.take() {
            reconciler.abort();
        }
        if let Some(monitor) = slot.monitor.take() {
            monitor.abort();
        }

        if let Some(process) = slot.process.take() {
            match process.terminate(self.settings.stop_grace).await {
                Ok(status) => info!(
                    "Stopped cloudflared tunnel for {}:{} ({})",
                    self.spec.hostname,
                    self.spec.local_port,
                    format_exit_status(status)
                ),
                Err(e) => warn!(
                    "Error while stopping tunnel for {}: {}",
                    self.spec.hostname, e
                ),
            }
        }

        let port = self.spec.local_port;
        if self.settings.clear_port_on_stop && self.probe.is_port_active(port).await {
            let cleared = self.reaper.clear_port(port).await;
            if cleared > 0 {
                info!("Cleared {} leftover process(es) on port {}", cleared, port);
            }
        }

        self.status.set_status(TunnelStatus::Stopped);
    }

    async fn reconcile(self: &Arc<Self>) {
        let mut slot = self.slot.lock().await;
        if self.stop_requested.load(Ordering::Acquire) {
            return;
        }

        let exited = match slot.process.as_mut().map(ProcessHandle::exit_status) {
            Some(None) => {
                if !self.auth_blocked.load(Ordering::Acquire) {
                    self.status.set_status(TunnelStatus::Running);
                }
                return;
            }
            Some(Some(status)) => Some(status),
            None => None,
        };

        if let Some(status) = exited {
            if let Some(monitor) = slot.monitor.take() {
                monitor.abort();
            }
            if let Some(process) = slot.process.take() {
                self.discard(process).await;
            }
            warn!(
                "cloudflared for {} terminated unexpectedly ({})",
                self.spec.hostname,
                format_exit_status(status)
            );
            // A rejected token stays the reported cause.
            if !self.auth_blocked.load(Ordering::Acquire) {
                self.status
                    .set_status(TunnelStatus::error(UNEXPECTED_TERMINATION));
            }
        } else if self.status.current() == TunnelStatus::Stopped {
            return;
        }

        if self.auth_blocked.load(Ordering::Acquire) {
            debug!(
                "Not restarting {}: token was rejected",
                self.spec.hostname
            );
            return;
        }

        let now = Utc::now();
        {
            let mut last_restart = self
                .last_restart
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(last) = *last_restart {
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                if elapsed < self.settings.restart_cooldown {
                    info!(
                        "Restart of {} deferred: cooldown has {:?} left",
                        self.spec.hostname,
                        self.settings.restart_cooldown - elapsed
                    );
                    return;
                }
            }
            *last_restart = Some(now);
        }

        info!(
            "Tunnel for {} terminated unexpectedly, attempting restart",
            self.spec.hostname
        );
        if let Err(e) = self.start_locked(&mut slot).await {
            warn!("Automatic restart of {} failed: {}", self.spec.hostname, e);
        }
    }

    fn apply_signal(&self, generation: u64, signal: OutputSignal) {
        if self.generation.load(Ordering::Acquire) != generation
            || self.stop_requested.load(Ordering::Acquire)
        {
            debug!("Ignoring output signal from a retired process: {:?}", signal);
            return;
        }

        match signal {
            OutputSignal::Error(message) => {
                warn!("cloudflared reported an error: {}", message);
                self.status.set_status(TunnelStatus::error(message));
            }
            OutputSignal::AuthenticationFailure(message) => {
                error!("cloudflared rejected the service token: {}", message);
                self.auth_blocked.store(true, Ordering::Release);
                self.status.set_status(TunnelStatus::error(format!(
                    "token authentication failed: {message}"
                )));
            }
            OutputSignal::UnexpectedTermination => {
                warn!("cloudflared output closed for {}", self.spec.hostname);
                self.status
                    .set_status(TunnelStatus::error(UNEXPECTED_TERMINATION));
            }
        }
    }

    fn spawn_monitor(self: &Arc<Self>, mut monitor: OutputMonitor, generation: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(signal) = monitor.next_signal().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.apply_signal(generation, signal);
            }
        })
    }

    fn spawn_reconciler(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.settings.reconcile_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.reconcile().await;
            }
        })
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let slot = self.slot.get_mut();
        for task in [slot.monitor.take(), slot.reconciler.take()].into_iter().flatten() {
            task.abort();
        }
        if slot.process.is_some() {
            warn!(
                "Supervisor for {} dropped while its tunnel was running, killing it",
                self.spec.hostname
            );
        }
    }
}

/// Format an automatic-restart time for display.
pub fn format_last_restart(last_restart: Option<DateTime<Utc>>) -> String {
    match last_restart {
        Some(at) => humantime_fmt::format_relative(at.into()).to_string(),
        None => "never".to_string(),
    }
}
