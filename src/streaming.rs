//! Exec/attach/portforward streaming sessions.
//!
//! `prepare_*` hands Kubelet a short-lived opaque token URL; the client then
//! connects to the streaming HTTP endpoint and upgrades the connection. On
//! connect the dispatcher enters the container's namespaces through
//! `/proc/<pid>/ns/*` and proxies bytes between the upgraded stream and the
//! spawned process (or, for port-forward, a socket dialed inside the pod's
//! network namespace).
//!
//! Tokens carry 128 bits of entropy and expire after sixty seconds; expiry
//! is enforced both on access and by a background sweeper.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use nix::sched::CloneFlags;
use papaya::HashMap as LockFreeConcurrentHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::{Code, Result, Status};
use crate::metrics::RuntimeMetrics;
use crate::state::ContainerState;
use crate::store::StateStore;
use crate::systemd::SystemdManager;
use crate::{log_info_globally, log_warn_globally};

/// Sessions expire this long after preparation.
const SESSION_TTL: Duration = Duration::from_secs(60);

/// Sweep cadence for expired sessions.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Grace between SIGTERM and SIGKILL on client disconnect.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Poll cadence when tailing a log file for attach.
const ATTACH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Namespaces an exec process joins, mount last.
const EXEC_NAMESPACES: [&str; 4] = ["net", "ipc", "uts", "mnt"];

#[derive(Clone)]
enum SessionKind {
    Exec {
        command: Vec<String>,
        stdin: bool,
    },
    Attach,
    PortForward {
        ports: Vec<u16>,
    },
}

impl SessionKind {
    fn path_segment(&self) -> &'static str {
        match self {
            SessionKind::Exec { .. } => "exec",
            SessionKind::Attach => "attach",
            SessionKind::PortForward { .. } => "portforward",
        }
    }
}

#[derive(Clone)]
struct Session {
    container_id: String,
    kind: SessionKind,
    expires_at: Instant,
}

/// Token dispatcher plus the streaming endpoint itself. Cheap to clone.
#[derive(Clone)]
pub struct StreamingServer {
    inner: Arc<StreamingInner>,
}

struct StreamingInner {
    sessions: LockFreeConcurrentHashMap<String, Session>,
    store: StateStore,
    systemd: SystemdManager,
    base_url: String,
    sessions_prepared: crate::metrics::Counter,
}

impl StreamingServer {
    pub fn new(
        store: StateStore,
        systemd: SystemdManager,
        host: String,
        port: u16,
        metrics: &RuntimeMetrics,
    ) -> Self {
        StreamingServer {
            inner: Arc::new(StreamingInner {
                sessions: LockFreeConcurrentHashMap::new(),
                store,
                systemd,
                base_url: format!("http://{host}:{port}"),
                sessions_prepared: metrics.exec_sessions_total.clone(),
            }),
        }
    }

    pub fn prepare_exec(
        &self,
        container_id: &str,
        command: Vec<String>,
        stdin: bool,
    ) -> Result<String> {
        if command.is_empty() {
            return Err(Status::new(Code::InvalidArgument, "exec-command-empty"));
        }
        self.require_running(container_id)?;
        Ok(self.insert(container_id, SessionKind::Exec { command, stdin }))
    }

    pub fn prepare_attach(&self, container_id: &str) -> Result<String> {
        self.require_running(container_id)?;
        Ok(self.insert(container_id, SessionKind::Attach))
    }

    pub fn prepare_port_forward(&self, pod_id: &str, ports: Vec<u16>) -> Result<String> {
        if ports.is_empty() {
            return Err(Status::new(Code::InvalidArgument, "portforward-no-ports"));
        }
        // Any running container of the pod anchors the network namespace.
        let anchor = self
            .inner
            .store
            .list_containers_for_pod(pod_id)?
            .into_iter()
            .find(|record| record.state == ContainerState::Running)
            .ok_or_else(|| Status::new(Code::FailedPrecondition, "pod-has-no-running-container"))?;
        Ok(self.insert(&anchor.id, SessionKind::PortForward { ports }))
    }

    fn require_running(&self, container_id: &str) -> Result<()> {
        let record = self.inner.store.load_container(container_id)?;
        if record.state != ContainerState::Running {
            return Err(Status::new(Code::FailedPrecondition, "container-not-running"));
        }
        Ok(())
    }

    fn insert(&self, container_id: &str, kind: SessionKind) -> String {
        let token = hex::encode(rand::random::<[u8; 16]>());
        let url = format!("{}/{}/{token}", self.inner.base_url, kind.path_segment());
        self.inner.sessions.pin().insert(
            token,
            Session {
                container_id: String::from(container_id),
                kind,
                expires_at: Instant::now() + SESSION_TTL,
            },
        );
        self.inner.sessions_prepared.inc();
        url
    }

    /// Consume a token. Expired or unknown tokens are indistinguishable.
    fn take_session(&self, kind_segment: &str, token: &str) -> Option<Session> {
        let sessions = self.inner.sessions.pin();
        let session = sessions.remove(token)?.clone();
        if session.expires_at <= Instant::now() {
            return None;
        }
        if session.kind.path_segment() != kind_segment {
            return None;
        }
        Some(session)
    }

    /// Drop expired sessions. Runs forever; spawn it.
    pub async fn sweep_expired(self) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let sessions = self.inner.sessions.pin();
            let expired: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| session.expires_at <= now)
                .map(|(token, _)| token.clone())
                .collect();
            for token in expired {
                sessions.remove(&token);
            }
        }
    }

    /// Synchronous exec with captured output, for `ExecSync`.
    pub async fn exec_sync(
        &self,
        container_id: &str,
        command: &[String],
        deadline: Duration,
    ) -> Result<(Vec<u8>, Vec<u8>, i32)> {
        if command.is_empty() {
            return Err(Status::new(Code::InvalidArgument, "exec-command-empty"));
        }
        self.require_running(container_id)?;
        let pid = self.resolve_pid(container_id).await?;

        let mut process = command_in_namespaces(pid, command)?;
        process
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = timeout(deadline, process.output())
            .await
            .map_err(|_elapsed| Status::new(Code::DeadlineExceeded, "exec-timeout"))?
            .map_err(|_| Status::new(Code::Internal, "exec-spawn-failed"))?;
        let exit_code = output.status.code().unwrap_or(-1);
        Ok((output.stdout, output.stderr, exit_code))
    }

    async fn resolve_pid(&self, container_id: &str) -> Result<u32> {
        let record = self.inner.store.load_container(container_id)?;
        if let Some(pid) = record.pid {
            return Ok(pid);
        }
        self.inner.systemd.service_main_pid(&record.unit_name).await
    }

    /// Serve the streaming endpoint until `shutdown` completes.
    pub async fn serve(self, port: u16, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
        let address = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(address)
            .await
            .map_err(|error| Status::new(Code::Unavailable, format!("streaming-bind: {error}")))?;
        log_info_globally!(port = port, "Streaming endpoint listening");

        tokio::pin!(shutdown);
        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            let (stream, _peer) = match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    log_warn_globally!("Streaming accept failed: {error}");
                    continue;
                }
            };

            let server = self.clone();
            tokio::task::spawn(async move {
                let service = service_fn(move |request| {
                    let server = server.clone();
                    async move {
                        Ok::<_, std::convert::Infallible>(server.route(request).await)
                    }
                });
                let result = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
                if let Err(error) = result {
                    log_warn_globally!("Streaming connection error: {error}");
                }
            });
        }
    }

    async fn route(&self, mut request: Request<Incoming>) -> Response<Full<Bytes>> {
        if request.method() != Method::GET {
            return plain_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
        }
        let path = String::from(request.uri().path());
        let mut segments = path.trim_start_matches('/').splitn(2, '/');
        let (Some(kind), Some(token)) = (segments.next(), segments.next()) else {
            return plain_response(StatusCode::NOT_FOUND, "not found\n");
        };
        let Some(session) = self.take_session(kind, token) else {
            return plain_response(StatusCode::NOT_FOUND, "unknown or expired token\n");
        };

        let server = self.clone();
        let upgrade = hyper::upgrade::on(&mut request);
        tokio::task::spawn(async move {
            let upgraded = match upgrade.await {
                Ok(upgraded) => TokioIo::new(upgraded),
                Err(error) => {
                    log_warn_globally!("Streaming upgrade failed: {error}");
                    return;
                }
            };
            if let Err(status) = server.run_session(session, upgraded).await {
                log_warn_globally!("Streaming session ended with error: {status}");
            }
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(hyper::header::CONNECTION, "Upgrade")
            .header(hyper::header::UPGRADE, "tcp")
            .body(Full::new(Bytes::new()))
            // Infallible for the static header set above.
            .unwrap()
    }

    async fn run_session(
        &self,
        session: Session,
        io: TokioIo<hyper::upgrade::Upgraded>,
    ) -> Result<()> {
        match &session.kind {
            SessionKind::Exec { command, stdin } => {
                let pid = self.resolve_pid(&session.container_id).await?;
                run_exec(pid, command.clone(), *stdin, io).await
            }
            SessionKind::Attach => {
                let record = self.inner.store.load_container(&session.container_id)?;
                run_attach(PathBuf::from(record.log_path), io).await
            }
            SessionKind::PortForward { ports } => {
                let pid = self.resolve_pid(&session.container_id).await?;
                run_port_forward(pid, ports[0], io).await
            }
        }
    }
}

/// Build a command that joins the target process's namespaces before exec.
/// The namespace descriptors are opened in the parent; `setns` runs in the
/// forked child, where single-threadedness makes the mount namespace join
/// legal.
fn command_in_namespaces(pid: u32, argv: &[String]) -> Result<Command> {
    let mut namespaces = Vec::with_capacity(EXEC_NAMESPACES.len());
    for name in EXEC_NAMESPACES {
        let file = std::fs::File::open(format!("/proc/{pid}/ns/{name}"))
            .map_err(|_| Status::new(Code::NotFound, "container-process-gone"))?;
        namespaces.push(file);
    }

    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]);
    unsafe {
        command.pre_exec(move || {
            for file in &namespaces {
                nix::sched::setns(file, CloneFlags::empty())
                    .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
            }
            Ok(())
        });
    }
    Ok(command)
}

async fn run_exec(
    pid: u32,
    command: Vec<String>,
    stdin: bool,
    io: TokioIo<hyper::upgrade::Upgraded>,
) -> Result<()> {
    let mut process = command_in_namespaces(pid, &command)?;
    process
        .stdin(if stdin { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = process
        .spawn()
        .map_err(|_| Status::new(Code::Internal, "exec-spawn-failed"))?;

    let (mut client_read, client_write) = tokio::io::split(io);

    // stdout and stderr funnel through one channel so a single task owns the
    // client write half.
    let (chunks, mut chunk_source) = mpsc::channel::<Vec<u8>>(16);
    if let Some(stdout) = child.stdout.take() {
        tokio::task::spawn(pump_output(stdout, chunks.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::task::spawn(pump_output(stderr, chunks.clone()));
    }
    drop(chunks);

    let writer = tokio::task::spawn(async move {
        let mut client_write = client_write;
        while let Some(chunk) = chunk_source.recv().await {
            if client_write.write_all(&chunk).await.is_err() {
                // Client went away.
                return false;
            }
        }
        let _ = client_write.flush().await;
        true
    });

    let stdin_pump = child.stdin.take().map(|mut sink| {
        tokio::task::spawn(async move {
            let _ = tokio::io::copy(&mut client_read, &mut sink).await;
        })
    });

    // The writer finishes when the child closes its output (normal exit) or
    // the client disconnects; in both cases buffered output has drained.
    let drained = writer.await.unwrap_or(false);
    if let Some(pump) = stdin_pump {
        pump.abort();
    }

    if child.try_wait().ok().flatten().is_none() {
        if !drained {
            log_info_globally!(pid = pid, "Exec client disconnected; terminating process");
        }
        signal_child(&child, nix::sys::signal::Signal::SIGTERM);
        if timeout(DISCONNECT_GRACE, child.wait()).await.is_err() {
            let _ = child.kill().await;
        }
    }
    let _ = child.wait().await;
    Ok(())
}

async fn pump_output(mut source: impl tokio::io::AsyncRead + Unpin, sink: mpsc::Sender<Vec<u8>>) {
    let mut buffer = [0u8; 8192];
    loop {
        match source.read(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(count) => {
                if sink.send(buffer[..count].to_vec()).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Attach streams the container log as it grows. Input is not wired to the
/// container's stdin; the service unit owns it.
async fn run_attach(log_path: PathBuf, io: TokioIo<hyper::upgrade::Upgraded>) -> Result<()> {
    let mut file = tokio::fs::File::open(&log_path)
        .await
        .map_err(|_| Status::new(Code::NotFound, "container-log-missing"))?;
    let (mut client_read, mut client_write) = tokio::io::split(io);

    // Disconnect surfaces as EOF/error on the client's read half.
    let mut disconnect = [0u8; 1];
    let mut buffer = [0u8; 8192];
    loop {
        tokio::select! {
            read = file.read(&mut buffer) => match read {
                Ok(0) => tokio::time::sleep(ATTACH_POLL_INTERVAL).await,
                Ok(count) => {
                    if client_write.write_all(&buffer[..count]).await.is_err() {
                        return Ok(());
                    }
                }
                Err(_) => return Ok(()),
            },
            _ = client_read.read(&mut disconnect) => return Ok(()),
        }
    }
}

async fn run_port_forward(
    pid: u32,
    port: u16,
    io: TokioIo<hyper::upgrade::Upgraded>,
) -> Result<()> {
    let upstream = connect_in_netns(pid, port).await?;
    let mut upstream = upstream;
    let mut io = io;
    let _ = tokio::io::copy_bidirectional(&mut io, &mut upstream).await;
    Ok(())
}

/// Dial `127.0.0.1:port` inside the network namespace of `pid`.
///
/// The connect happens on a scratch thread that joins the namespace; the
/// connected socket remains usable from any thread afterwards.
async fn connect_in_netns(pid: u32, port: u16) -> Result<tokio::net::TcpStream> {
    let stream = tokio::task::spawn_blocking(move || -> Result<std::net::TcpStream> {
        let netns = std::fs::File::open(format!("/proc/{pid}/ns/net"))
            .map_err(|_| Status::new(Code::NotFound, "container-process-gone"))?;
        let worker = std::thread::spawn(move || -> Result<std::net::TcpStream> {
            nix::sched::setns(&netns, CloneFlags::CLONE_NEWNET)
                .map_err(|errno| Status::new(Code::Internal, format!("netns-join: {errno}")))?;
            std::net::TcpStream::connect(("127.0.0.1", port))
                .map_err(|error| Status::new(Code::Unavailable, format!("portforward-dial: {error}")))
        });
        worker
            .join()
            .unwrap_or_else(|_| Err(Status::new(Code::Internal, "netns-thread-panicked")))
    })
    .await
    .unwrap_or_else(|_| Err(Status::new(Code::Internal, "netns-task-panicked")))?;

    stream
        .set_nonblocking(true)
        .map_err(|_| Status::new(Code::Internal, "portforward-socket"))?;
    tokio::net::TcpStream::from_std(stream)
        .map_err(|_| Status::new(Code::Internal, "portforward-socket"))
}

fn signal_child(child: &tokio::process::Child, signal: nix::sys::signal::Signal) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal);
    }
}

fn plain_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(String::from(body))))
        // Infallible for the static header set above.
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_have_128_bits_of_entropy() {
        let token = hex::encode(rand::random::<[u8; 16]>());
        assert_eq!(token.len(), 32);
        assert_ne!(token, hex::encode(rand::random::<[u8; 16]>()));
    }

    #[test]
    fn session_kinds_map_to_path_segments() {
        assert_eq!(
            SessionKind::Exec {
                command: vec![String::from("/bin/sh")],
                stdin: false,
            }
            .path_segment(),
            "exec",
        );
        assert_eq!(SessionKind::Attach.path_segment(), "attach");
        assert_eq!(
            SessionKind::PortForward { ports: vec![80] }.path_segment(),
            "portforward",
        );
    }

    #[test]
    fn expired_sessions_are_unusable() {
        let sessions: LockFreeConcurrentHashMap<String, Session> =
            LockFreeConcurrentHashMap::new();
        let pinned = sessions.pin();
        pinned.insert(
            String::from("token"),
            Session {
                container_id: String::from("c"),
                kind: SessionKind::Attach,
                // Already expired.
                expires_at: Instant::now() - Duration::from_secs(1),
            },
        );

        let session = pinned.remove("token").cloned();
        assert!(session.is_some());
        assert!(session.unwrap().expires_at <= Instant::now());
    }
}
