//! Local process manager.
//!
//! Runs each container's configured command as a host process with piped
//! stdio. Images are recorded but never resolved and no isolation is set up;
//! this backend exists so the API is usable end to end on a single host.
//!
//! Output is fanned out to one bounded channel per attach session. A slow
//! client slows the output pumps down instead of losing bytes, and a client
//! that attaches before `start` (as `docker run -it` does) sees everything
//! the process writes.

use crate::{
    config::ContainerConfig,
    error::{ContainerError, Result},
    manager::{AttachConfig, ContainerManager, CreateResult, StartConfig},
    session::{AttachSession, DetachKeys, OutputChunk, OutputStream, SessionEnd, StdStream},
    state::{Container, ContainerId, ContainerState},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, StreamExt};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

const OUTPUT_CHANNEL_CAPACITY: usize = 64;
const STDIN_CHANNEL_CAPACITY: usize = 64;
const PUMP_BUF_SIZE: usize = 8 * 1024;
/// How long a pump waits for more output once the process has exited.
/// A background child can keep the pipe open indefinitely.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Options for [`LocalManager`].
#[derive(Debug, Clone, Default)]
pub struct LocalManagerOptions {
    /// Detach keys used when neither the attach request nor the last start
    /// request supplied any.
    pub default_detach_keys: Option<DetachKeys>,
}

/// Container-side stdio endpoints, shared by all attach sessions.
struct ContainerIo {
    /// One sender per attached session. Cleared when a run's output ends.
    subscribers: Mutex<Vec<mpsc::Sender<OutputChunk>>>,
    stdin: Mutex<StdinChannel>,
}

/// The sender stays here so sessions can clone it; the receiver is handed
/// to the process's stdin writer when the container starts.
struct StdinChannel {
    tx: Option<mpsc::Sender<Bytes>>,
    rx: Option<mpsc::Receiver<Bytes>>,
}

impl ContainerIo {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(STDIN_CHANNEL_CAPACITY);
        Self {
            subscribers: Mutex::new(Vec::new()),
            stdin: Mutex::new(StdinChannel {
                tx: Some(tx),
                rx: Some(rx),
            }),
        }
    }

    /// Returns the receiver for a new run, re-arming the channel if a
    /// previous run consumed it.
    fn take_stdin_receiver(&self) -> Result<mpsc::Receiver<Bytes>> {
        let mut channel = self
            .stdin
            .lock()
            .map_err(|_| ContainerError::Runtime("lock poisoned".to_string()))?;
        if let Some(rx) = channel.rx.take() {
            return Ok(rx);
        }
        let (tx, rx) = mpsc::channel(STDIN_CHANNEL_CAPACITY);
        channel.tx = Some(tx);
        Ok(rx)
    }

    fn stdin_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.stdin.lock().ok()?.tx.clone()
    }

    fn close_stdin(&self) {
        if let Ok(mut channel) = self.stdin.lock() {
            channel.tx = None;
        }
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<OutputChunk>> {
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        self.subscribers
            .lock()
            .map_err(|_| ContainerError::Runtime("lock poisoned".to_string()))?
            .push(tx);
        Ok(rx)
    }

    /// Delivers `chunk` to every attached session, waiting for room in each
    /// session's channel.
    async fn publish(&self, chunk: OutputChunk) {
        let subscribers = match self.subscribers.lock() {
            Ok(subscribers) => subscribers.clone(),
            Err(_) => return,
        };

        let mut detached = false;
        for tx in &subscribers {
            if tx.send(chunk.clone()).await.is_err() {
                detached = true;
            }
        }
        if detached {
            if let Ok(mut subscribers) = self.subscribers.lock() {
                subscribers.retain(|tx| !tx.is_closed());
            }
        }
    }

    /// Ends the output stream of every attached session.
    fn close_output(&self) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.clear();
        }
    }
}

struct Entry {
    container: Container,
    io: Arc<ContainerIo>,
    exit: Option<watch::Receiver<Option<i32>>>,
}

type ContainerMap = Arc<RwLock<HashMap<ContainerId, Entry>>>;

/// Container manager backed by host processes.
pub struct LocalManager {
    containers: ContainerMap,
    /// Sends (container_id, new_state) on every transition.
    state_sender: broadcast::Sender<(ContainerId, ContainerState)>,
    options: LocalManagerOptions,
}

impl LocalManager {
    /// Creates a new local manager.
    #[must_use]
    pub fn new(options: LocalManagerOptions) -> Self {
        let (state_sender, _) = broadcast::channel(256);
        Self {
            containers: Arc::new(RwLock::new(HashMap::new())),
            state_sender,
            options,
        }
    }

    /// Subscribes to container state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> broadcast::Receiver<(ContainerId, ContainerState)> {
        self.state_sender.subscribe()
    }

    /// Gets container information by ID, ID prefix or name.
    #[must_use]
    pub fn get(&self, id_or_name: &str) -> Option<Container> {
        let containers = self.containers.read().ok()?;
        let id = resolve(&containers, id_or_name)?;
        containers.get(&id).map(|e| e.container.clone())
    }

    /// Lists all containers.
    #[must_use]
    pub fn list(&self) -> Vec<Container> {
        self.containers
            .read()
            .map(|c| c.values().map(|e| e.container.clone()).collect())
            .unwrap_or_default()
    }

    /// Stops every running or stopping container. Each gets its own
    /// `StopTimeout`, or `default_timeout` if it has none.
    pub async fn stop_all(&self, default_timeout: Duration) {
        let running: Vec<(String, Duration)> = self
            .list()
            .into_iter()
            .filter(|c| matches!(c.state, ContainerState::Running | ContainerState::Stopping))
            .map(|c| {
                let timeout = c
                    .config
                    .stop_timeout
                    .map_or(default_timeout, Duration::from_secs);
                (c.id.to_string(), timeout)
            })
            .collect();

        let stops = running.iter().map(|(id, timeout)| async move {
            if let Err(e) = self.stop(id, *timeout).await {
                tracing::warn!(container = %id, error = %e, "failed to stop container");
            }
        });
        future::join_all(stops).await;
    }

    fn lookup(&self, id_or_name: &str) -> Result<ContainerId> {
        let containers = self
            .containers
            .read()
            .map_err(|_| ContainerError::Runtime("lock poisoned".to_string()))?;
        resolve(&containers, id_or_name).ok_or_else(|| ContainerError::not_found(id_or_name))
    }

    fn set_state(&self, id: &ContainerId, state: ContainerState) {
        let _ = self.state_sender.send((id.clone(), state));
    }
}

impl Default for LocalManager {
    fn default() -> Self {
        Self::new(LocalManagerOptions::default())
    }
}

#[async_trait]
impl ContainerManager for LocalManager {
    async fn create(&self, name: &str, config: ContainerConfig) -> Result<CreateResult> {
        let name = name.strip_prefix('/').unwrap_or(name);
        if !name.is_empty() {
            validate_name(name)?;
        }
        if let Some(sig) = config.stop_signal.as_deref() {
            parse_signal(sig)?;
        }

        let mut warnings = Vec::new();
        if config.argv().is_empty() {
            warnings.push("no command configured; start will fail until Cmd or Entrypoint is set".to_string());
        }
        if config.user.is_some() {
            warnings.push("User is ignored by the local process manager".to_string());
        }
        if config.tty {
            warnings.push("Tty is ignored; output is relayed from pipes".to_string());
        }

        let mut containers = self
            .containers
            .write()
            .map_err(|_| ContainerError::Runtime("lock poisoned".to_string()))?;

        if !name.is_empty() && containers.values().any(|e| e.container.name == name) {
            return Err(ContainerError::AlreadyExists(name.to_string()));
        }

        let mut container = Container::new(name, config);
        if name.is_empty() {
            container.name = format!("berth_{}", container.id.short());
        }
        let id = container.id.clone();

        tracing::info!(container = %container.name, id = %id.short(), "container created");
        containers.insert(
            id.clone(),
            Entry {
                container,
                io: Arc::new(ContainerIo::new()),
                exit: None,
            },
        );
        drop(containers);
        self.set_state(&id, ContainerState::Created);

        Ok(CreateResult { id, warnings })
    }

    async fn start(&self, config: StartConfig) -> Result<()> {
        let detach_keys = match config.detach_keys.as_deref() {
            Some(keys) if !keys.is_empty() => {
                DetachKeys::parse(keys)?;
                Some(keys.to_string())
            }
            _ => None,
        };
        let id = self.lookup(&config.id)?;

        // Check, spawn and record under one write lock so concurrent starts
        // cannot launch the process twice.
        let mut containers = self
            .containers
            .write()
            .map_err(|_| ContainerError::Runtime("lock poisoned".to_string()))?;
        let entry = containers
            .get_mut(&id)
            .ok_or_else(|| ContainerError::not_found(id.to_string()))?;

        match entry.container.state {
            ContainerState::Running => return Ok(()),
            ContainerState::Stopping => {
                return Err(ContainerError::invalid_state(
                    "cannot start a container that is stopping",
                ))
            }
            ContainerState::Created | ContainerState::Exited | ContainerState::Dead => {}
        }

        let container_config = &entry.container.config;
        let argv = container_config.argv();
        let Some((program, args)) = argv.split_first() else {
            return Err(ContainerError::config(format!(
                "container {} has no command configured",
                entry.container.name
            )));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(container_config.env_pairs())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if container_config.open_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(dir) = container_config.working_dir.as_deref().filter(|d| !d.is_empty()) {
            command.current_dir(dir);
        }

        // Everything fallible happens before spawn; once the child exists it
        // must reach the reaper.
        let stdin_rx = if container_config.open_stdin {
            Some(entry.io.take_stdin_receiver()?)
        } else {
            None
        };

        let mut child = command.spawn().map_err(|e| {
            ContainerError::Runtime(format!("failed to start {}: {e}", entry.container.name))
        })?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let exited = CancellationToken::new();
        let io = Arc::clone(&entry.io);

        if let (Some(stdin), Some(rx)) = (child.stdin.take(), stdin_rx) {
            spawn_stdin_writer(stdin, rx, exit_rx.clone());
        }
        let pumps = [
            child.stdout.take().map(|out| {
                spawn_pump(out, StdStream::Stdout, Arc::clone(&io), exited.clone())
            }),
            child.stderr.take().map(|err| {
                spawn_pump(err, StdStream::Stderr, Arc::clone(&io), exited.clone())
            }),
        ];

        entry.container.state = ContainerState::Running;
        entry.container.pid = child.id();
        entry.container.started_at = Some(chrono::Utc::now());
        entry.container.finished_at = None;
        entry.container.exit_code = None;
        if detach_keys.is_some() {
            entry.container.detach_keys = detach_keys;
        }
        entry.exit = Some(exit_rx);

        tracing::info!(
            container = %entry.container.name,
            pid = ?entry.container.pid,
            "container started"
        );
        drop(containers);
        self.set_state(&id, ContainerState::Running);

        let containers = Arc::clone(&self.containers);
        let state_sender = self.state_sender.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            exited.cancel();
            // Pumps finish once attached sessions have taken all output.
            future::join_all(pumps.into_iter().flatten()).await;

            let code = match status {
                Ok(status) => exit_code(status),
                Err(e) => {
                    tracing::warn!(id = %id.short(), error = %e, "failed to wait for container process");
                    -1
                }
            };

            // Closing under the write lock keeps attach from subscribing to
            // a run that has already ended.
            let guard = containers.write();
            io.close_output();
            if let Ok(mut containers) = guard {
                if let Some(entry) = containers.get_mut(&id) {
                    entry.container.state = ContainerState::Exited;
                    entry.container.exit_code = Some(code);
                    entry.container.finished_at = Some(chrono::Utc::now());
                    entry.container.pid = None;
                    tracing::info!(container = %entry.container.name, exit_code = code, "container exited");
                }
            }

            let _ = exit_tx.send(Some(code));
            let _ = state_sender.send((id, ContainerState::Exited));
        });

        Ok(())
    }

    async fn stop(&self, name: &str, timeout: Duration) -> Result<()> {
        let id = self.lookup(name)?;

        let (pid, mut exit, stop_signal) = {
            let mut containers = self
                .containers
                .write()
                .map_err(|_| ContainerError::Runtime("lock poisoned".to_string()))?;
            let entry = containers
                .get_mut(&id)
                .ok_or_else(|| ContainerError::not_found(id.to_string()))?;

            // A second stop joins one already in progress.
            if !matches!(
                entry.container.state,
                ContainerState::Running | ContainerState::Stopping
            ) {
                return Err(ContainerError::invalid_state(format!(
                    "cannot stop container {} from state {}",
                    entry.container.name, entry.container.state
                )));
            }
            let (Some(pid), Some(exit)) = (entry.container.pid, entry.exit.clone()) else {
                return Err(ContainerError::invalid_state(format!(
                    "container {} has no process",
                    entry.container.name
                )));
            };
            let stop_signal = match entry.container.config.stop_signal.as_deref() {
                Some(sig) => parse_signal(sig)?,
                None => Signal::SIGTERM,
            };

            entry.container.state = ContainerState::Stopping;
            (pid, exit, stop_signal)
        };
        self.set_state(&id, ContainerState::Stopping);
        // Dropped on every early return, including a cancelled future.
        let _guard = StoppingGuard {
            containers: Arc::clone(&self.containers),
            state_sender: self.state_sender.clone(),
            id: id.clone(),
        };

        let pid = Pid::from_raw(
            i32::try_from(pid).map_err(|_| ContainerError::runtime(format!("invalid pid {pid}")))?,
        );
        send_signal(pid, stop_signal)?;

        if tokio::time::timeout(timeout, wait_exit(&mut exit)).await.is_ok() {
            return Ok(());
        }

        tracing::warn!(
            id = %id.short(),
            timeout_secs = timeout.as_secs(),
            "container did not exit after {stop_signal}, killing"
        );
        send_signal(pid, Signal::SIGKILL)?;
        wait_exit(&mut exit).await;
        Ok(())
    }

    async fn attach(&self, name: &str, config: AttachConfig) -> Result<SessionEnd> {
        let id = self.lookup(name)?;

        let (container, io, output) = {
            let containers = self
                .containers
                .read()
                .map_err(|_| ContainerError::Runtime("lock poisoned".to_string()))?;
            let entry = containers
                .get(&id)
                .ok_or_else(|| ContainerError::not_found(id.to_string()))?;

            if matches!(
                entry.container.state,
                ContainerState::Exited | ContainerState::Dead
            ) {
                return Err(ContainerError::invalid_state(format!(
                    "container {} is not running",
                    entry.container.name
                )));
            }

            // The reaper closes output and marks the container Exited under
            // the write lock, so this subscription is always closed.
            let output = entry.io.subscribe()?;
            (entry.container.clone(), Arc::clone(&entry.io), output)
        };

        let output = output_stream(output, config.stdout, config.stderr);
        let mut session = AttachSession::new(container.name.clone(), config.connection, output);

        let stdin = if config.stdin && container.config.open_stdin {
            io.stdin_sender()
        } else {
            if config.stdin {
                tracing::debug!(container = %container.name, "stdin requested but container has OpenStdin=false");
            }
            None
        };
        let has_stdin = stdin.is_some();
        if let Some(stdin) = stdin {
            session = session.with_stdin(stdin);
        }

        let detach_keys = match config.detach_keys {
            Some(keys) => Some(keys),
            None => match container.detach_keys.as_deref() {
                Some(keys) => Some(DetachKeys::parse(keys)?),
                None => self.options.default_detach_keys.clone(),
            },
        };
        if let Some(keys) = detach_keys {
            session = session.with_detach_keys(keys);
        }

        tracing::info!(
            container = %container.name,
            stdin = has_stdin,
            upgrade = config.upgrade,
            "attach session started"
        );
        let end = session.run().await;

        if has_stdin && container.config.stdin_once {
            io.close_stdin();
        }
        end
    }
}

/// Resolves a container by full ID, name or unique ID prefix (3+ chars).
fn resolve(containers: &HashMap<ContainerId, Entry>, id_or_name: &str) -> Option<ContainerId> {
    let id_or_name = id_or_name.strip_prefix('/').unwrap_or(id_or_name);

    let container_id = ContainerId::from_string(id_or_name);
    if containers.contains_key(&container_id) {
        return Some(container_id);
    }

    if let Some(entry) = containers.values().find(|e| e.container.name == id_or_name) {
        return Some(entry.container.id.clone());
    }

    if id_or_name.len() >= 3 {
        let mut matches = containers
            .keys()
            .filter(|id| id.as_str().starts_with(id_or_name));
        if let (Some(id), None) = (matches.next(), matches.next()) {
            return Some(id.clone());
        }
    }

    None
}

fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_first = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid_first && valid_rest && name.len() > 1 {
        Ok(())
    } else {
        Err(ContainerError::config(format!(
            "invalid container name \"{name}\", only [a-zA-Z0-9][a-zA-Z0-9_.-] are allowed"
        )))
    }
}

/// Accepts `SIGTERM`, `TERM` or a signal number.
fn parse_signal(sig: &str) -> Result<Signal> {
    let invalid = || ContainerError::config(format!("invalid stop signal: {sig}"));
    if let Ok(number) = sig.parse::<i32>() {
        return Signal::try_from(number).map_err(|_| invalid());
    }
    let upper = sig.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name).map_err(|_| invalid())
}

fn send_signal(pid: Pid, sig: Signal) -> Result<()> {
    match signal::kill(pid, sig) {
        // Already gone; the reaper records the exit.
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(ContainerError::Runtime(format!(
            "failed to send {sig} to pid {pid}: {e}"
        ))),
    }
}

async fn wait_exit(exit: &mut watch::Receiver<Option<i32>>) {
    // The reaper always publishes before dropping the sender.
    let _ = exit.wait_for(Option::is_some).await;
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

/// Reverts a `Stopping` container to `Running` if its stop did not see the
/// process exit.
struct StoppingGuard {
    containers: ContainerMap,
    state_sender: broadcast::Sender<(ContainerId, ContainerState)>,
    id: ContainerId,
}

impl Drop for StoppingGuard {
    fn drop(&mut self) {
        let Ok(mut containers) = self.containers.write() else {
            return;
        };
        // The reaper moves the container to Exited once the process is gone.
        if let Some(entry) = containers.get_mut(&self.id) {
            if entry.container.state == ContainerState::Stopping {
                entry.container.state = ContainerState::Running;
                drop(containers);
                let _ = self
                    .state_sender
                    .send((self.id.clone(), ContainerState::Running));
            }
        }
    }
}

fn output_stream(rx: mpsc::Receiver<OutputChunk>, stdout: bool, stderr: bool) -> OutputStream {
    ReceiverStream::new(rx)
        .filter(move |chunk| {
            future::ready(match chunk.stream {
                StdStream::Stdout => stdout,
                StdStream::Stderr => stderr,
            })
        })
        .boxed()
}

fn spawn_pump<R>(
    mut reader: R,
    stream: StdStream,
    io: Arc<ContainerIo>,
    exited: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; PUMP_BUF_SIZE];
        loop {
            let read = tokio::select! {
                biased;
                read = reader.read(&mut buf) => read,
                () = exited.cancelled() => {
                    match tokio::time::timeout(PUMP_DRAIN_TIMEOUT, reader.read(&mut buf)).await {
                        Ok(read) => read,
                        Err(_) => {
                            tracing::debug!(?stream, "output pipe still open after exit");
                            break;
                        }
                    }
                }
            };
            match read {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = OutputChunk {
                        stream,
                        data: Bytes::copy_from_slice(&buf[..n]),
                    };
                    io.publish(chunk).await;
                }
                Err(e) => {
                    tracing::debug!(?stream, error = %e, "container output pipe failed");
                    break;
                }
            }
        }
    })
}

/// Single writer for the process's stdin; sessions only hold channel senders.
fn spawn_stdin_writer(
    mut stdin: ChildStdin,
    mut rx: mpsc::Receiver<Bytes>,
    mut exit: watch::Receiver<Option<i32>>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                data = rx.recv() => {
                    let Some(data) = data else { break };
                    let written = async {
                        stdin.write_all(&data).await?;
                        stdin.flush().await
                    };
                    if let Err(e) = written.await {
                        tracing::debug!(error = %e, "container stdin closed");
                        break;
                    }
                }
                _ = exit.changed() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Connection;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    fn shell(script: &str) -> ContainerConfig {
        ContainerConfig {
            image: "busybox".to_string(),
            cmd: vec!["/bin/sh".into(), "-c".into(), script.into()],
            ..Default::default()
        }
    }

    fn attach_config(stdin: bool) -> (DuplexStream, AttachConfig) {
        let (client, server) = duplex(4096);
        let connection: Connection = Box::new(server);
        (
            client,
            AttachConfig {
                stdin,
                stdout: true,
                stderr: true,
                upgrade: true,
                detach_keys: None,
                connection,
            },
        )
    }

    async fn wait_for_state(manager: &LocalManager, name: &str, state: ContainerState) {
        timeout(TEST_TIMEOUT, async {
            loop {
                if manager.get(name).map(|c| c.state) == Some(state) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn create_generates_name_when_empty() {
        let manager = LocalManager::default();
        let result = manager.create("", shell("true")).await.unwrap();

        let container = manager.get(result.id.as_str()).unwrap();
        assert!(container.name.starts_with("berth_"));
        assert_eq!(container.state, ContainerState::Created);
        assert!(result.warnings.is_empty());
    }

    #[tokio::test]
    async fn create_rejects_duplicate_and_invalid_names() {
        let manager = LocalManager::default();
        manager.create("web", shell("true")).await.unwrap();

        let dup = manager.create("/web", shell("true")).await.unwrap_err();
        assert!(matches!(dup, ContainerError::AlreadyExists(_)));

        let invalid = manager.create("-bad name", shell("true")).await.unwrap_err();
        assert!(matches!(invalid, ContainerError::Config(_)));
    }

    #[tokio::test]
    async fn create_warns_without_command() {
        let manager = LocalManager::default();
        let config = ContainerConfig {
            image: "scratch".to_string(),
            ..Default::default()
        };
        let result = manager.create("empty", config).await.unwrap();
        assert_eq!(result.warnings.len(), 1);

        let err = manager
            .start(StartConfig {
                id: "empty".to_string(),
                detach_keys: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::Config(_)));
    }

    #[tokio::test]
    async fn resolve_by_prefix_and_name() {
        let manager = LocalManager::default();
        let result = manager.create("api", shell("true")).await.unwrap();

        assert!(manager.get("api").is_some());
        assert!(manager.get(&result.id.as_str()[..8]).is_some());
        assert!(manager.get("nope").is_none());
    }

    #[tokio::test]
    async fn start_runs_until_exit() {
        let manager = LocalManager::default();
        manager.create("job", shell("exit 3")).await.unwrap();
        manager
            .start(StartConfig {
                id: "job".to_string(),
                detach_keys: None,
            })
            .await
            .unwrap();

        wait_for_state(&manager, "job", ContainerState::Exited).await;
        assert_eq!(manager.get("job").unwrap().exit_code, Some(3));
    }

    #[tokio::test]
    async fn start_rejects_invalid_detach_keys() {
        let manager = LocalManager::default();
        manager.create("job", shell("true")).await.unwrap();
        let err = manager
            .start(StartConfig {
                id: "job".to_string(),
                detach_keys: Some("ctrl-1".to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::Config(_)));
    }

    #[tokio::test]
    async fn stop_sends_signal_then_waits() {
        let manager = LocalManager::default();
        manager.create("sleeper", shell("exec sleep 30")).await.unwrap();
        manager
            .start(StartConfig {
                id: "sleeper".to_string(),
                detach_keys: None,
            })
            .await
            .unwrap();

        timeout(TEST_TIMEOUT, manager.stop("sleeper", Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();

        let container = manager.get("sleeper").unwrap();
        assert_eq!(container.state, ContainerState::Exited);
        assert_eq!(container.exit_code, Some(128 + 15));
    }

    /// Starts a container that ignores SIGTERM.
    async fn start_stubborn(manager: &LocalManager) {
        manager
            .create("stubborn", shell("trap '' TERM; while true; do sleep 1; done"))
            .await
            .unwrap();
        manager
            .start(StartConfig {
                id: "stubborn".to_string(),
                detach_keys: None,
            })
            .await
            .unwrap();
        // Give the shell a moment to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn stop_escalates_to_kill_after_timeout() {
        let manager = LocalManager::default();
        start_stubborn(&manager).await;

        timeout(TEST_TIMEOUT, manager.stop("stubborn", Duration::from_millis(300)))
            .await
            .unwrap()
            .unwrap();

        let container = manager.get("stubborn").unwrap();
        assert_eq!(container.state, ContainerState::Exited);
        assert_eq!(container.exit_code, Some(128 + 9));
    }

    #[tokio::test]
    async fn cancelled_stop_leaves_container_stoppable() {
        let manager = LocalManager::default();
        start_stubborn(&manager).await;

        let cancelled = timeout(
            Duration::from_millis(200),
            manager.stop("stubborn", Duration::from_secs(30)),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(manager.get("stubborn").unwrap().state, ContainerState::Running);

        timeout(TEST_TIMEOUT, manager.stop("stubborn", Duration::from_millis(300)))
            .await
            .unwrap()
            .unwrap();
        let container = manager.get("stubborn").unwrap();
        assert_eq!(container.state, ContainerState::Exited);
        assert_eq!(container.exit_code, Some(128 + 9));
    }

    #[tokio::test]
    async fn stop_all_covers_container_already_stopping() {
        let manager = Arc::new(LocalManager::default());
        start_stubborn(&manager).await;

        let slow_stop = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.stop("stubborn", Duration::from_secs(30)).await })
        };
        wait_for_state(&manager, "stubborn", ContainerState::Stopping).await;

        timeout(TEST_TIMEOUT, manager.stop_all(Duration::from_millis(300)))
            .await
            .unwrap();
        assert_eq!(manager.get("stubborn").unwrap().exit_code, Some(128 + 9));

        // The first stop sees the same exit.
        timeout(TEST_TIMEOUT, slow_stop).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn start_failure_before_spawn_launches_nothing() {
        let manager = LocalManager::default();
        let config = ContainerConfig {
            image: "busybox".to_string(),
            cmd: vec!["cat".to_string()],
            open_stdin: true,
            ..Default::default()
        };
        manager.create("poisoned", config).await.unwrap();

        let io = {
            let containers = manager.containers.read().unwrap();
            Arc::clone(&containers.values().next().unwrap().io)
        };
        let _ = std::thread::spawn(move || {
            let _channel = io.stdin.lock().unwrap();
            panic!("poison the stdin lock");
        })
        .join();

        let err = manager
            .start(StartConfig {
                id: "poisoned".to_string(),
                detach_keys: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::Runtime(_)));

        let container = manager.get("poisoned").unwrap();
        assert_eq!(container.state, ContainerState::Created);
        assert!(container.pid.is_none());
    }

    #[tokio::test]
    async fn stop_all_stops_running_containers() {
        let manager = LocalManager::default();
        for name in ["one", "two"] {
            manager.create(name, shell("exec sleep 30")).await.unwrap();
            manager
                .start(StartConfig {
                    id: name.to_string(),
                    detach_keys: None,
                })
                .await
                .unwrap();
        }
        manager.create("idle", shell("true")).await.unwrap();

        timeout(TEST_TIMEOUT, manager.stop_all(Duration::from_secs(5)))
            .await
            .unwrap();

        assert!(manager.list().iter().all(|c| !c.is_running()));
        assert_eq!(manager.get("idle").unwrap().state, ContainerState::Created);
    }

    #[tokio::test]
    async fn stop_requires_running_container() {
        let manager = LocalManager::default();
        manager.create("idle", shell("true")).await.unwrap();
        let err = manager.stop("idle", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, ContainerError::InvalidState(_)));

        let err = manager.stop("missing", Duration::ZERO).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn attach_echoes_stdin_through_cat() {
        let manager = Arc::new(LocalManager::default());
        let config = ContainerConfig {
            image: "busybox".to_string(),
            cmd: vec!["cat".to_string()],
            open_stdin: true,
            ..Default::default()
        };
        manager.create("echo", config).await.unwrap();
        manager
            .start(StartConfig {
                id: "echo".to_string(),
                detach_keys: None,
            })
            .await
            .unwrap();

        let (mut client, attach) = attach_config(true);
        let session = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.attach("echo", attach).await })
        };

        client.write_all(b"hello\n").await.unwrap();
        let mut buf = [0u8; 6];
        timeout(TEST_TIMEOUT, client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hello\n");

        drop(client);
        let end = timeout(TEST_TIMEOUT, session).await.unwrap().unwrap().unwrap();
        assert_eq!(end, SessionEnd::ClientClosed);

        // Detaching leaves the container running.
        assert!(manager.get("echo").unwrap().is_running());
        manager.stop("echo", Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn attach_before_start_sees_all_output() {
        let manager = Arc::new(LocalManager::default());
        manager
            .create("greeter", shell("echo out; echo err >&2"))
            .await
            .unwrap();

        let (mut client, attach) = attach_config(false);
        let session = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.attach("greeter", attach).await })
        };
        // Let the session subscribe before the process starts.
        tokio::time::sleep(Duration::from_millis(50)).await;

        manager
            .start(StartConfig {
                id: "greeter".to_string(),
                detach_keys: None,
            })
            .await
            .unwrap();

        let end = timeout(TEST_TIMEOUT, session).await.unwrap().unwrap().unwrap();
        assert_eq!(end, SessionEnd::OutputClosed);

        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();
        assert!(received.contains("out\n"));
        assert!(received.contains("err\n"));
    }

    #[tokio::test]
    async fn slow_client_receives_all_output() {
        const SIZE: usize = 8 * 1024 * 1024;

        let manager = Arc::new(LocalManager::default());
        manager
            .create("flood", shell(&format!("head -c {SIZE} /dev/zero")))
            .await
            .unwrap();

        let (mut client, attach) = attach_config(false);
        let session = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.attach("flood", attach).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager
            .start(StartConfig {
                id: "flood".to_string(),
                detach_keys: None,
            })
            .await
            .unwrap();

        // Far more than the channels and the 4 KiB pipe can hold.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let mut received = Vec::new();
        timeout(TEST_TIMEOUT, client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.len(), SIZE);
        assert!(received.iter().all(|&b| b == 0));

        let end = timeout(TEST_TIMEOUT, session).await.unwrap().unwrap().unwrap();
        assert_eq!(end, SessionEnd::OutputClosed);
        wait_for_state(&manager, "flood", ContainerState::Exited).await;
        assert_eq!(manager.get("flood").unwrap().exit_code, Some(0));
    }

    #[tokio::test]
    async fn attach_to_exited_container_fails() {
        let manager = LocalManager::default();
        manager.create("done", shell("true")).await.unwrap();
        manager
            .start(StartConfig {
                id: "done".to_string(),
                detach_keys: None,
            })
            .await
            .unwrap();
        wait_for_state(&manager, "done", ContainerState::Exited).await;

        let (_client, attach) = attach_config(false);
        let err = manager.attach("done", attach).await.unwrap_err();
        assert!(matches!(err, ContainerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn stdin_once_closes_container_stdin_after_session() {
        let manager = Arc::new(LocalManager::default());
        let config = ContainerConfig {
            image: "busybox".to_string(),
            cmd: vec!["cat".to_string()],
            open_stdin: true,
            stdin_once: true,
            ..Default::default()
        };
        manager.create("once", config).await.unwrap();
        manager
            .start(StartConfig {
                id: "once".to_string(),
                detach_keys: None,
            })
            .await
            .unwrap();

        let (client, attach) = attach_config(true);
        drop(client);
        let end = manager.attach("once", attach).await.unwrap();
        assert_eq!(end, SessionEnd::ClientClosed);

        // cat exits once its stdin reaches EOF.
        wait_for_state(&manager, "once", ContainerState::Exited).await;
    }

    #[test]
    fn parse_signal_forms() {
        assert_eq!(parse_signal("SIGINT").unwrap(), Signal::SIGINT);
        assert_eq!(parse_signal("term").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("9").unwrap(), Signal::SIGKILL);
        assert!(parse_signal("SIGNOPE").is_err());
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("web-1.app_x").is_ok());
        assert!(validate_name("a").is_err());
        assert!(validate_name("_web").is_err());
        assert!(validate_name("we b").is_err());
    }
}
