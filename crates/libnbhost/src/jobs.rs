//! Background jobs submitted to the host environment.
//!
//! Every submission returns a [`JobHandle`] whose completion future is tied to
//! that one job. There is no shared "any job ended" stream to filter.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{HostError, HostResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Declared identity of a job, used to recognise a server left running by an
/// earlier orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    pub kind: String,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobScope {
    Workspace(PathBuf),
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reveal {
    Always,
    Silent,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Panel {
    Shared,
    Dedicated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presentation {
    pub reveal: Reveal,
    pub panel: Panel,
    pub echo: bool,
}

impl Default for Presentation {
    fn default() -> Self {
        Self {
            reveal: Reveal::Always,
            panel: Panel::Shared,
            echo: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub definition: JobDefinition,
    pub scope: JobScope,
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub presentation: Presentation,
    pub is_background: bool,
    /// Collect stdout into [`JobExit::stdout`] instead of revealing it.
    pub capture_stdout: bool,
}

impl JobSpec {
    pub fn new(kind: &str, name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            definition: JobDefinition {
                kind: kind.to_string(),
                port: None,
            },
            scope: JobScope::Global,
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            presentation: Presentation::default(),
            is_background: false,
            capture_stdout: false,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn scope(mut self, scope: JobScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.definition.port = Some(port);
        self
    }

    pub fn presentation(mut self, presentation: Presentation) -> Self {
        self.presentation = presentation;
        self
    }

    pub fn background(mut self) -> Self {
        self.is_background = true;
        self
    }

    pub fn capture_stdout(mut self) -> Self {
        self.capture_stdout = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub definition: JobDefinition,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobExit {
    /// `None` when the process was killed by a signal or could not be reaped.
    pub code: Option<i32>,
    pub stdout: Option<String>,
}

impl JobExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "no exit code".to_string(),
        }
    }
}

/// A submitted job plus its completion future.
#[derive(Debug, Clone)]
pub struct JobHandle {
    info: JobInfo,
    exit: watch::Receiver<Option<JobExit>>,
}

impl JobHandle {
    pub fn new(info: JobInfo, exit: watch::Receiver<Option<JobExit>>) -> Self {
        Self { info, exit }
    }

    pub fn id(&self) -> JobId {
        self.info.id
    }

    pub fn info(&self) -> &JobInfo {
        &self.info
    }

    pub fn try_exit(&self) -> Option<JobExit> {
        self.exit.borrow().clone()
    }

    /// Resolves once this job (and only this job) has ended.
    pub async fn wait(&mut self) -> JobExit {
        let reported = self
            .exit
            .wait_for(Option::is_some)
            .await
            .map(|exit| exit.clone());
        match reported {
            Ok(exit) => exit.unwrap_or_default(),
            // Dispatcher went away without reporting; treat as killed.
            Err(_) => self.exit.borrow().clone().unwrap_or_default(),
        }
    }
}

/// The host environment that runs background jobs.
pub trait JobHost: Send + Sync {
    fn running_jobs(&self) -> Vec<JobInfo>;

    fn submit(&self, spec: JobSpec) -> HostResult<JobHandle>;

    fn attach(&self, id: JobId) -> Option<JobHandle>;

    /// Ask the job to end. Completion is reported through its handle.
    fn terminate(&self, id: JobId) -> bool;
}

struct RunningJob {
    info: JobInfo,
    exit: watch::Receiver<Option<JobExit>>,
    kill: Option<oneshot::Sender<()>>,
}

type JobTable = Arc<Mutex<HashMap<JobId, RunningJob>>>;

/// [`JobHost`] backed by local `tokio` child processes. Dropping the host
/// terminates every job it still tracks.
#[derive(Default)]
pub struct ProcessJobHost {
    jobs: JobTable,
    next_id: AtomicU64,
}

impl ProcessJobHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<JobId, RunningJob>> {
        lock(&self.jobs)
    }
}

fn lock(jobs: &JobTable) -> MutexGuard<'_, HashMap<JobId, RunningJob>> {
    jobs.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JobHost for ProcessJobHost {
    fn running_jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self.table().values().map(|j| j.info.clone()).collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    fn submit(&self, spec: JobSpec) -> HostResult<JobHandle> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(spec.is_background);
        if let JobScope::Workspace(dir) = &spec.scope {
            cmd.current_dir(dir);
        }

        let revealed = spec.presentation.reveal != Reveal::Never;
        cmd.stdout(if spec.capture_stdout || revealed {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stderr(if revealed { Stdio::piped() } else { Stdio::null() });

        if spec.presentation.echo {
            info!(job = %spec.name, "> {} {}", spec.command, spec.args.join(" "));
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| HostError::LaunchFailed(format!("{}: {err}", spec.command)))?;

        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let info = JobInfo {
            id,
            name: spec.name.clone(),
            definition: spec.definition.clone(),
        };
        let label = match spec.presentation.panel {
            Panel::Dedicated => spec.name.clone(),
            Panel::Shared => "jobs".to_string(),
        };

        let captured = if spec.capture_stdout {
            child.stdout.take().map(|out| tokio::spawn(read_all(out)))
        } else {
            if let Some(out) = child.stdout.take() {
                tokio::spawn(forward_lines(out, label.clone(), spec.presentation.reveal));
            }
            None
        };
        if let Some(err) = child.stderr.take() {
            tokio::spawn(forward_lines(err, label, spec.presentation.reveal));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        self.table().insert(
            id,
            RunningJob {
                info: info.clone(),
                exit: exit_rx.clone(),
                kill: Some(kill_tx),
            },
        );

        debug!(job = %id, name = %spec.name, background = spec.is_background, "job submitted");
        tokio::spawn(supervise(
            id,
            child,
            kill_rx,
            captured,
            exit_tx,
            Arc::clone(&self.jobs),
        ));

        Ok(JobHandle::new(info, exit_rx))
    }

    fn attach(&self, id: JobId) -> Option<JobHandle> {
        self.table()
            .get(&id)
            .map(|job| JobHandle::new(job.info.clone(), job.exit.clone()))
    }

    fn terminate(&self, id: JobId) -> bool {
        let kill = self.table().get_mut(&id).and_then(|job| job.kill.take());
        match kill {
            Some(kill) => kill.send(()).is_ok(),
            None => false,
        }
    }
}

async fn supervise(
    id: JobId,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    captured: Option<JoinHandle<String>>,
    exit_tx: watch::Sender<Option<JobExit>>,
    jobs: JobTable,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(err) = child.start_kill() {
                warn!(job = %id, "failed to kill job: {err}");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(err) => {
            warn!(job = %id, "failed to reap job: {err}");
            None
        }
    };
    let stdout = match captured {
        Some(task) => task.await.ok(),
        None => None,
    };

    lock(&jobs).remove(&id);
    debug!(job = %id, ?code, "job ended");
    exit_tx.send_replace(Some(JobExit { code, stdout }));
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = String::new();
    if let Err(err) = reader.read_to_string(&mut buf).await {
        warn!("failed to read job output: {err}");
    }
    buf
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, label: String, reveal: Reveal) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match reveal {
                Reveal::Always => info!(job = %label, "{line}"),
                _ => debug!(job = %label, "{line}"),
            },
            Ok(None) => break,
            Err(err) => {
                debug!(job = %label, "output stream closed: {err}");
                break;
            }
        }
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(kind: &str, script: &str) -> JobSpec {
        JobSpec::new(kind, kind, "sh").args(["-c", script])
    }

    #[tokio::test]
    async fn reports_exit_code_of_its_own_job() {
        let host = ProcessJobHost::new();
        let mut failing = host.submit(sh("fail", "exit 3")).expect("submit");
        let mut ok = host.submit(sh("ok", "exit 0")).expect("submit");

        assert_eq!(failing.wait().await.code, Some(3));
        assert!(ok.wait().await.success());
    }

    #[tokio::test]
    async fn captures_stdout_in_memory() {
        let host = ProcessJobHost::new();
        let mut handle = host
            .submit(sh("creds", "printf 'A=1\\nB=2\\n'").capture_stdout())
            .expect("submit");
        let exit = handle.wait().await;
        assert!(exit.success());
        assert_eq!(exit.stdout.as_deref(), Some("A=1\nB=2\n"));
    }

    #[tokio::test]
    async fn terminate_ends_background_job() {
        let host = ProcessJobHost::new();
        let mut handle = host
            .submit(sh("server", "sleep 30").background())
            .expect("submit");
        assert_eq!(host.running_jobs().len(), 1);
        assert!(host.terminate(handle.id()));

        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("job ended");
        assert!(!exit.success());
        assert!(host.running_jobs().is_empty());
        assert!(!host.terminate(handle.id()));
    }

    #[tokio::test]
    async fn attach_observes_same_completion() {
        let host = ProcessJobHost::new();
        let handle = host.submit(sh("server", "sleep 0.2").background()).expect("submit");
        let mut attached = host.attach(handle.id()).expect("still running");
        assert_eq!(attached.info().name, "server");
        assert!(attached.wait().await.success());
        assert!(host.attach(handle.id()).is_none());
    }

    #[tokio::test]
    async fn env_and_scope_reach_the_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let host = ProcessJobHost::new();
        let mut env = BTreeMap::new();
        env.insert("NBHOST_TEST_VALUE".to_string(), "42".to_string());
        let mut handle = host
            .submit(
                sh("env", "printf '%s %s' \"$NBHOST_TEST_VALUE\" \"$(pwd)\"")
                    .env(env)
                    .scope(JobScope::Workspace(dir.path().to_path_buf()))
                    .capture_stdout(),
            )
            .expect("submit");
        let out = handle.wait().await.stdout.unwrap_or_default();
        let dir_name = dir.path().file_name().expect("name").to_string_lossy();
        assert!(out.starts_with("42 "));
        assert!(out.ends_with(dir_name.as_ref()));
    }

    fn handle(exit: watch::Receiver<Option<JobExit>>) -> JobHandle {
        JobHandle::new(
            JobInfo {
                id: JobId(7),
                name: "server".to_string(),
                definition: JobDefinition {
                    kind: "engine-server".to_string(),
                    port: None,
                },
            },
            exit,
        )
    }

    #[tokio::test]
    async fn wait_returns_the_reported_exit() {
        let (tx, rx) = watch::channel(None);
        let mut job = handle(rx);
        tx.send_replace(Some(JobExit {
            code: Some(5),
            stdout: None,
        }));
        assert_eq!(job.wait().await.code, Some(5));
    }

    #[tokio::test]
    async fn wait_without_a_reporter_is_treated_as_killed() {
        let (tx, rx) = watch::channel(None);
        let mut job = handle(rx);
        drop(tx);
        assert_eq!(job.wait().await, JobExit::default());
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_failure() {
        let host = ProcessJobHost::new();
        let err = host
            .submit(JobSpec::new("x", "x", "/definitely/not/a/binary"))
            .expect_err("spawn fails");
        assert!(matches!(err, HostError::LaunchFailed(_)));
    }
}
