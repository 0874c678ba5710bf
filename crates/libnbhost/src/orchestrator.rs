//! Engine server lifecycle: `Idle -> Starting -> Running -> Stopping -> Idle`.
//!
//! The whole lifecycle is one [`Lifecycle`] value behind a `watch` channel.
//! `start()` claims it with a check-and-set, so a second caller fails fast
//! with [`HostError::AlreadyRunning`] instead of racing.

use std::sync::{Arc, Weak};

use nbhost_protocol::paths::local_server_url;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bootstrap::BootstrapRunner;
use crate::config::HostConfig;
use crate::error::{HostError, HostResult};
use crate::jobs::{JobHandle, JobHost, JobId, JobInfo, ProcessJobHost};
use crate::launch::{self, SERVER_JOB_KIND};
use crate::port::PortAllocator;
use crate::readiness::ReadinessPoller;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum Lifecycle {
    Idle,
    Starting {
        job: Option<JobId>,
        port: Option<u16>,
        cancel: CancellationToken,
    },
    Running {
        job: JobId,
        port: u16,
        /// Found already running instead of launched by this orchestrator.
        adopted: bool,
    },
    Stopping {
        job: JobId,
        port: u16,
    },
}

impl Lifecycle {
    pub fn name(&self) -> &'static str {
        match self {
            Lifecycle::Idle => "idle",
            Lifecycle::Starting { .. } => "starting",
            Lifecycle::Running { .. } => "running",
            Lifecycle::Stopping { .. } => "stopping",
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Lifecycle::Idle => None,
            Lifecycle::Starting { port, .. } => *port,
            Lifecycle::Running { port, .. } | Lifecycle::Stopping { port, .. } => Some(*port),
        }
    }

    fn job(&self) -> Option<JobId> {
        match self {
            Lifecycle::Idle => None,
            Lifecycle::Starting { job, .. } => *job,
            Lifecycle::Running { job, .. } | Lifecycle::Stopping { job, .. } => Some(*job),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    PortChanged { preferred: u16, actual: u16 },
    Ready { port: u16 },
    /// The server job ended. `None` when it was killed.
    Stopped { exit_code: Option<i32> },
}

struct Inner {
    config: HostConfig,
    host: Arc<dyn JobHost>,
    ports: PortAllocator,
    state: watch::Sender<Lifecycle>,
    events: broadcast::Sender<ServerEvent>,
}

#[derive(Clone)]
pub struct ServerOrchestrator {
    inner: Arc<Inner>,
}

impl ServerOrchestrator {
    pub fn new(config: HostConfig, host: Arc<dyn JobHost>) -> Self {
        let (state, _) = watch::channel(Lifecycle::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                ports: PortAllocator::new(config.port_search_window),
                config,
                host,
                state,
                events,
            }),
        }
    }

    /// Orchestrator backed by local child processes.
    pub fn with_process_host(config: HostConfig) -> Self {
        Self::new(config, Arc::new(ProcessJobHost::new()))
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<Lifecycle> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> Lifecycle {
        self.inner.state.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.inner.state.borrow(), Lifecycle::Running { .. })
    }

    pub fn actual_port(&self) -> Option<u16> {
        self.inner.state.borrow().port()
    }

    /// Base URL of the server, only once it is ready.
    pub fn server_url(&self) -> Option<String> {
        match *self.inner.state.borrow() {
            Lifecycle::Running { port, .. } => Some(local_server_url(port)),
            _ => None,
        }
    }

    /// Start (or adopt) the engine server and return the port it serves on.
    pub async fn start(&self) -> HostResult<u16> {
        let cancel = CancellationToken::new();
        let claimed = self.inner.state.send_if_modified(|state| {
            if matches!(state, Lifecycle::Idle) {
                *state = Lifecycle::Starting {
                    job: None,
                    port: None,
                    cancel: cancel.clone(),
                };
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(HostError::AlreadyRunning);
        }

        let mut guard = StartGuard {
            inner: &self.inner,
            job: None,
            armed: true,
        };
        let result = self.run_start(&cancel, &mut guard).await;
        match &result {
            Ok(port) => {
                guard.armed = false;
                info!(port, "engine server running");
                let _ = self.inner.events.send(ServerEvent::Ready { port: *port });
            }
            Err(err) => warn!("engine server start failed: {err}"),
        }
        result
    }

    async fn run_start(&self, cancel: &CancellationToken, guard: &mut StartGuard<'_>) -> HostResult<u16> {
        let inner = &self.inner;
        let config = &inner.config;

        if let Some((handle, port)) = self.find_existing() {
            let job = handle.id();
            info!(job = %job, port, "adopting running engine server");
            self.transition_to_running(cancel, job, port, true)?;
            self.spawn_exit_listener(handle);
            return Ok(port);
        }

        let assignment = inner.ports.assign(config.port).await?;
        let port = assignment.actual;
        if assignment.changed() {
            warn!(
                preferred = assignment.preferred,
                actual = port,
                "preferred port is busy, using another"
            );
            let _ = inner.events.send(ServerEvent::PortChanged {
                preferred: assignment.preferred,
                actual: port,
            });
        }
        inner.state.send_modify(|state| {
            if let Lifecycle::Starting { port: slot, .. } = state {
                *slot = Some(port);
            }
        });

        // Bootstrap is allowed to finish even if a stop arrives meanwhile.
        let outcome = BootstrapRunner::new(config, inner.host.as_ref()).run().await?;
        if cancel.is_cancelled() {
            return Err(HostError::StartCancelled);
        }

        let poller = ReadinessPoller::from_config(&config.readiness)?;
        let spec = launch::server_spec(config, port, &outcome.credentials);
        let mut handle = inner.host.submit(spec)?;
        let job = handle.id();
        guard.job = Some(job);
        inner.state.send_modify(|state| {
            if let Lifecycle::Starting { job: slot, .. } = state {
                *slot = Some(job);
            }
        });
        self.spawn_exit_listener(handle.clone());
        info!(job = %job, port, "engine server launched");

        let grace = config.startup_grace();
        tokio::select! {
            _ = tokio::time::sleep(grace) => {}
            _ = cancel.cancelled() => return Err(HostError::StartCancelled),
            exit = handle.wait() => return Err(exited_early(exit.describe())),
        }

        let url = local_server_url(port);
        tokio::select! {
            ready = poller.poll_until_ready(&url, cancel) => { ready?; }
            exit = handle.wait() => return Err(exited_early(exit.describe())),
        }

        self.confirm_running(cancel, &handle, port)
    }

    /// Moves a launched job to `Running`. A job that ended while still
    /// `Starting` was skipped by its exit listener, so it is caught here.
    fn confirm_running(&self, cancel: &CancellationToken, handle: &JobHandle, port: u16) -> HostResult<u16> {
        let job = handle.id();
        self.transition_to_running(cancel, job, port, false)?;
        if let Some(exit) = handle.try_exit() {
            self.reset_if_current(job);
            return Err(exited_early(exit.describe()));
        }
        Ok(port)
    }

    fn reset_if_current(&self, job: JobId) {
        self.inner.state.send_if_modified(|state| {
            if state.job() == Some(job) {
                *state = Lifecycle::Idle;
                true
            } else {
                false
            }
        });
    }

    fn find_existing(&self) -> Option<(JobHandle, u16)> {
        let name = launch::server_job_name(self.inner.config.port);
        let info: JobInfo = self
            .inner
            .host
            .running_jobs()
            .into_iter()
            .find(|job| job.name == name || job.definition.kind == SERVER_JOB_KIND)?;
        let port = info.definition.port.unwrap_or(self.inner.config.port);
        let handle = self.inner.host.attach(info.id)?;
        Some((handle, port))
    }

    fn transition_to_running(
        &self,
        cancel: &CancellationToken,
        job: JobId,
        port: u16,
        adopted: bool,
    ) -> HostResult<()> {
        let moved = self.inner.state.send_if_modified(|state| {
            if matches!(state, Lifecycle::Starting { .. }) && !cancel.is_cancelled() {
                *state = Lifecycle::Running { job, port, adopted };
                true
            } else {
                false
            }
        });
        if moved {
            Ok(())
        } else {
            Err(HostError::StartCancelled)
        }
    }

    /// Resets the lifecycle when this particular job ends, then notifies.
    fn spawn_exit_listener(&self, mut handle: JobHandle) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let exit = handle.wait().await;
            let job = handle.id();
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // A start in flight handles its own job ending.
            inner.state.send_if_modified(|state| match state {
                Lifecycle::Running { job: current, .. } | Lifecycle::Stopping { job: current, .. }
                    if *current == job =>
                {
                    *state = Lifecycle::Idle;
                    true
                }
                _ => false,
            });
            info!(job = %job, "engine server ended with {}", exit.describe());
            let _ = inner.events.send(ServerEvent::Stopped {
                exit_code: exit.code,
            });
        });
    }

    /// Ask the server to stop. Completion is observed through the lifecycle
    /// and a [`ServerEvent::Stopped`] notification. During a start this
    /// cancels the wait for readiness; `start()` then returns
    /// [`HostError::StartCancelled`].
    pub fn stop(&self) {
        let mut target = None;
        self.inner.state.send_if_modified(|state| match state {
            Lifecycle::Idle | Lifecycle::Stopping { .. } => false,
            Lifecycle::Starting { cancel, .. } => {
                info!("stop requested during start, cancelling");
                cancel.cancel();
                false
            }
            Lifecycle::Running { job, port, .. } => {
                target = Some(*job);
                *state = Lifecycle::Stopping {
                    job: *job,
                    port: *port,
                };
                true
            }
        });
        if let Some(job) = target {
            info!(job = %job, "stopping engine server");
            if !self.inner.host.terminate(job) {
                debug!(job = %job, "server job already gone");
                self.reset_if_current(job);
            }
        }
    }

    pub async fn wait_until_stopped(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| matches!(state, Lifecycle::Idle)).await;
    }

    /// Stop, wait for the old server to end, then start again.
    pub async fn restart(&self) -> HostResult<u16> {
        self.stop();
        self.wait_until_stopped().await;
        self.start().await
    }

    /// Waits out a start in progress. Returns whether the server is running;
    /// resolves immediately when no start is in flight.
    pub async fn wait_for_ready(&self) -> bool {
        let mut rx = self.inner.state.subscribe();
        match rx
            .wait_for(|state| !matches!(state, Lifecycle::Starting { .. }))
            .await
        {
            Ok(state) => matches!(*state, Lifecycle::Running { .. }),
            Err(_) => false,
        }
    }
}

fn exited_early(describe: String) -> HostError {
    HostError::LaunchFailed(format!("server exited with {describe} before becoming ready"))
}

/// Returns the lifecycle to `Idle` unless the start succeeded, terminating a
/// server job that was launched but never became ready. Also covers a
/// `start()` future dropped mid-flight.
struct StartGuard<'a> {
    inner: &'a Inner,
    job: Option<JobId>,
    armed: bool,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(job) = self.job {
            debug!(job = %job, "terminating server job from failed start");
            self.inner.host.terminate(job);
        }
        self.inner.state.send_if_modified(|state| {
            if matches!(state, Lifecycle::Starting { .. }) {
                *state = Lifecycle::Idle;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::fake::FakeJobHost;
    use crate::launch::SETUP_JOB_KIND;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr").port()
    }

    async fn config(attempts: u32) -> HostConfig {
        let mut config = HostConfig {
            port: free_port().await,
            workspace: Some(std::env::temp_dir()),
            ..HostConfig::default()
        };
        config.toolchain.enabled = false;
        config.server.startup_grace_ms = 0;
        config.readiness.max_attempts = attempts;
        config.readiness.interval_ms = 10;
        config.readiness.request_timeout_ms = 500;
        config
    }

    fn orchestrator(config: HostConfig) -> (ServerOrchestrator, Arc<FakeJobHost>) {
        let host = Arc::new(FakeJobHost::default());
        host.exit_with(SETUP_JOB_KIND, 0, None);
        let orch = ServerOrchestrator::new(config, host.clone());
        (orch, host)
    }

    /// Plays the engine: binds the port of every submitted server job.
    fn serve_engine_jobs(host: Arc<FakeJobHost>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut served = HashSet::new();
            loop {
                let pending: Vec<(JobId, u16)> = host
                    .submitted
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|s| s.spec.definition.kind == SERVER_JOB_KIND)
                    .filter_map(|s| s.spec.definition.port.map(|port| (s.id, port)))
                    .filter(|(id, _)| !served.contains(id))
                    .collect();
                for (id, port) in pending {
                    served.insert(id);
                    let listener = TcpListener::bind(("127.0.0.1", port)).await.expect("bind");
                    tokio::spawn(async move {
                        while let Ok((mut stream, _)) = listener.accept().await {
                            let mut buf = [0u8; 1024];
                            let _ = stream.read(&mut buf).await;
                            let _ = stream
                                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                                .await;
                        }
                    });
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    }

    async fn wait_for_state(orch: &ServerOrchestrator, pred: impl Fn(&Lifecycle) -> bool) {
        let mut rx = orch.watch_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| pred(s)))
            .await
            .expect("state reached")
            .expect("orchestrator alive");
    }

    #[tokio::test]
    async fn start_bootstraps_launches_and_reports_ready() {
        let cfg = config(300).await;
        let preferred = cfg.port;
        let (orch, host) = orchestrator(cfg);
        let engine = serve_engine_jobs(host.clone());
        let mut events = orch.subscribe();

        assert!(!orch.is_running());
        let port = orch.start().await.expect("start");
        assert_eq!(port, preferred);
        assert!(orch.is_running());
        assert_eq!(orch.actual_port(), Some(port));
        assert_eq!(orch.server_url(), Some(format!("http://localhost:{port}")));
        assert_eq!(host.kinds(), vec![SETUP_JOB_KIND, SERVER_JOB_KIND]);
        assert_eq!(events.recv().await.expect("event"), ServerEvent::Ready { port });

        let spec = host.spec_of(SERVER_JOB_KIND).expect("server spec");
        assert_eq!(spec.name, format!("Engine Server (port {port})"));
        assert!(spec.is_background);
        engine.abort();
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let (orch, host) = orchestrator(config(300).await);
        let engine = serve_engine_jobs(host.clone());
        orch.start().await.expect("start");

        let err = orch.start().await.expect_err("duplicate");
        assert!(matches!(err, HostError::AlreadyRunning));
        assert_eq!(
            host.kinds().iter().filter(|k| *k == SERVER_JOB_KIND).count(),
            1
        );
        engine.abort();
    }

    #[tokio::test]
    async fn start_while_starting_fails_fast() {
        let (orch, host) = orchestrator(config(1_000).await);
        let first = tokio::spawn({
            let orch = orch.clone();
            async move { orch.start().await }
        });
        wait_for_state(&orch, |s| matches!(s, Lifecycle::Starting { job: Some(_), .. })).await;

        let err = orch.start().await.expect_err("in flight");
        assert!(matches!(err, HostError::AlreadyRunning));

        orch.stop();
        let err = first.await.expect("join").expect_err("cancelled");
        assert!(matches!(err, HostError::StartCancelled));
        assert!(host.running_jobs().is_empty());
    }

    #[tokio::test]
    async fn busy_port_falls_back_and_notifies() {
        let cfg = config(300).await;
        let preferred = cfg.port;
        let _busy = TcpListener::bind(("127.0.0.1", preferred)).await.expect("occupy");
        let (orch, host) = orchestrator(cfg);
        let engine = serve_engine_jobs(host.clone());
        let mut events = orch.subscribe();

        let port = orch.start().await.expect("start");
        assert_ne!(port, preferred);
        assert_eq!(
            events.recv().await.expect("event"),
            ServerEvent::PortChanged {
                preferred,
                actual: port
            }
        );
        assert_eq!(events.recv().await.expect("event"), ServerEvent::Ready { port });
        engine.abort();
    }

    #[tokio::test]
    async fn bootstrap_failure_leaves_orchestrator_retryable() {
        let (orch, host) = orchestrator(config(300).await);
        host.exit_with(SETUP_JOB_KIND, 1, None);

        let err = orch.start().await.expect_err("bootstrap");
        assert!(matches!(err, HostError::BootstrapFailed(_)));
        assert!(matches!(orch.state(), Lifecycle::Idle));
        assert!(host.spec_of(SERVER_JOB_KIND).is_none());

        host.exit_with(SETUP_JOB_KIND, 0, None);
        let engine = serve_engine_jobs(host.clone());
        orch.start().await.expect("retry");
        assert!(orch.is_running());
        engine.abort();
    }

    #[tokio::test]
    async fn readiness_timeout_terminates_the_job() {
        let (orch, host) = orchestrator(config(3).await);

        let err = orch.start().await.expect_err("not ready");
        assert!(matches!(err, HostError::ServerNotReady { attempts: 3 }));
        assert!(matches!(orch.state(), Lifecycle::Idle));
        assert!(host.running_jobs().is_empty());
        assert!(orch.actual_port().is_none());
    }

    #[tokio::test]
    async fn server_exiting_before_ready_is_a_launch_failure() {
        let (orch, host) = orchestrator(config(1_000).await);
        let crasher = tokio::spawn({
            let host = host.clone();
            async move {
                loop {
                    if let Some(id) = host.last_id(SERVER_JOB_KIND) {
                        host.finish(id, Some(1));
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        });

        let err = orch.start().await.expect_err("crashed");
        match err {
            HostError::LaunchFailed(message) => assert!(message.contains("exit code 1")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(orch.state(), Lifecycle::Idle));
        crasher.await.expect("join");
    }

    #[tokio::test]
    async fn submit_failure_is_a_launch_failure() {
        let (orch, host) = orchestrator(config(300).await);
        host.fail_submit(SERVER_JOB_KIND);
        let err = orch.start().await.expect_err("launch");
        assert!(matches!(err, HostError::LaunchFailed(_)));
        assert!(matches!(orch.state(), Lifecycle::Idle));
    }

    #[tokio::test]
    async fn job_exit_resets_state_and_notifies() {
        let (orch, host) = orchestrator(config(300).await);
        let engine = serve_engine_jobs(host.clone());
        orch.start().await.expect("start");
        let mut events = orch.subscribe();

        let id = host.last_id(SERVER_JOB_KIND).expect("server job");
        host.finish(id, Some(0));
        wait_for_state(&orch, |s| matches!(s, Lifecycle::Idle)).await;

        assert_eq!(
            events.recv().await.expect("event"),
            ServerEvent::Stopped { exit_code: Some(0) }
        );
        assert!(!orch.is_running());
        assert!(orch.server_url().is_none());
        assert!(orch.actual_port().is_none());
        engine.abort();
    }

    #[tokio::test]
    async fn stop_terminates_through_the_exit_listener() {
        let (orch, host) = orchestrator(config(300).await);
        let engine = serve_engine_jobs(host.clone());
        orch.start().await.expect("start");
        let mut events = orch.subscribe();

        orch.stop();
        orch.wait_until_stopped().await;
        assert_eq!(
            events.recv().await.expect("event"),
            ServerEvent::Stopped { exit_code: None }
        );
        assert!(host.running_jobs().is_empty());
        engine.abort();
    }

    #[tokio::test]
    async fn stop_when_idle_is_a_noop() {
        let (orch, _host) = orchestrator(config(3).await);
        orch.stop();
        assert!(matches!(orch.state(), Lifecycle::Idle));
        assert!(!orch.wait_for_ready().await);
    }

    #[tokio::test]
    async fn wait_for_ready_follows_an_inflight_start() {
        let (orch, host) = orchestrator(config(300).await);
        let engine = serve_engine_jobs(host.clone());
        let start = tokio::spawn({
            let orch = orch.clone();
            async move { orch.start().await }
        });
        wait_for_state(&orch, |s| !matches!(s, Lifecycle::Idle)).await;

        assert!(orch.wait_for_ready().await);
        start.await.expect("join").expect("start");
        engine.abort();
    }

    #[tokio::test]
    async fn adopts_a_server_left_running() {
        let cfg = config(3).await;
        let port = cfg.port;
        let (orch, host) = orchestrator(cfg);
        let existing = host.add_preexisting(&launch::server_job_name(port), SERVER_JOB_KIND, port);
        let mut events = orch.subscribe();

        assert_eq!(orch.start().await.expect("adopt"), port);
        assert!(host.kinds().is_empty());
        assert!(matches!(
            orch.state(),
            Lifecycle::Running { job, adopted: true, .. } if job == existing
        ));
        assert_eq!(events.recv().await.expect("event"), ServerEvent::Ready { port });

        orch.stop();
        orch.wait_until_stopped().await;
        assert!(host.running_jobs().is_empty());
    }

    #[tokio::test]
    async fn restart_launches_a_fresh_job() {
        let (orch, host) = orchestrator(config(300).await);
        let engine = serve_engine_jobs(host.clone());
        orch.start().await.expect("start");
        let first = host.last_id(SERVER_JOB_KIND).expect("first job");

        orch.restart().await.expect("restart");
        let second = host.last_id(SERVER_JOB_KIND).expect("second job");
        assert_ne!(first, second);
        assert!(orch.is_running());
        engine.abort();
    }

    #[tokio::test]
    async fn server_ending_as_it_becomes_ready_is_not_left_running() {
        let (orch, host) = orchestrator(config(300).await);
        let spec = crate::jobs::JobSpec::new(SERVER_JOB_KIND, launch::server_job_name(4321), "julia")
            .port(4321)
            .background();
        let handle = host.submit(spec).expect("submit");
        let cancel = CancellationToken::new();
        orch.inner.state.send_replace(Lifecycle::Starting {
            job: Some(handle.id()),
            port: Some(4321),
            cancel: cancel.clone(),
        });
        // Its exit listener already looked while the lifecycle was `Starting`.
        host.finish(handle.id(), Some(1));

        let err = orch
            .confirm_running(&cancel, &handle, 4321)
            .expect_err("job already ended");
        assert!(matches!(err, HostError::LaunchFailed(ref m) if m.contains("exit code 1")));
        assert!(matches!(orch.state(), Lifecycle::Idle));
        assert!(!orch.is_running());
    }
}
