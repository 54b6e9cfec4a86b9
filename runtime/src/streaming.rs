//! The streaming session manager: exec/attach/port-forward.
//!
//! A session is registered by the gRPC facade (`Exec`/`Attach`/`PortForward`)
//! and consumed exactly once by the first matching HTTP upgrade. The table
//! itself never touches the State Store — it is purely in-memory, per §4.8.

use std::collections::HashMap;
use std::convert::Infallible;
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};

use crate::engine::Engine;
use crate::error::{Dependency, ErrorKind, Result, RuntimeError};
use crate::ids::{ContainerId, PodId, SessionId};

const STREAM_PROTOCOL: &str = "v4.channel.k8s.io";

const FRAME_STDIN: u8 = 0;
const FRAME_STDOUT: u8 = 1;
const FRAME_STDERR: u8 = 2;
const FRAME_RESIZE: u8 = 3;
const FRAME_CLOSE: u8 = 4;

/// Bare command names the namespace-entering exec path resolves to an
/// absolute path, per §4.8. Kept as the documented allow-list rather than
/// the redesign-flagged login-shell wrap: a container's overlay may not
/// carry a shell at all, and this adapter has no way to know.
const COMMAND_ALLOW_LIST: &[(&str, &str)] = &[
    ("sh", "/bin/sh"),
    ("bash", "/bin/bash"),
    ("cat", "/bin/cat"),
    ("ls", "/bin/ls"),
    ("echo", "/bin/echo"),
    ("grep", "/bin/grep"),
    ("sleep", "/bin/sleep"),
    ("touch", "/bin/touch"),
    ("hostname", "/bin/hostname"),
    ("id", "/usr/bin/id"),
    ("ps", "/bin/ps"),
    ("env", "/usr/bin/env"),
    ("pwd", "/bin/pwd"),
    ("whoami", "/usr/bin/whoami"),
    ("uname", "/bin/uname"),
];

fn resolve_command(name: &str) -> String {
    if name.starts_with('/') {
        return name.to_string();
    }
    for (bare, absolute) in COMMAND_ALLOW_LIST {
        if *bare == name {
            return (*absolute).to_string();
        }
    }
    format!("/bin/{name}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Exec,
    Attach,
    PortForward,
}

/// Target of a streaming session: exec/attach address a container, while
/// port-forward addresses a pod (the pod's network namespace is shared by
/// all its containers).
#[derive(Debug, Clone)]
pub enum SessionTarget {
    Container(ContainerId),
    Pod(PodId),
}

#[derive(Debug, Clone)]
pub struct StreamingSession {
    pub id: SessionId,
    pub kind: SessionKind,
    pub target: SessionTarget,
    pub command: Vec<String>,
    pub tty: bool,
    pub stdin: bool,
    pub ports: Vec<u16>,
    pub created_at: i64,
}

/// The in-memory session table plus the HTTP upgrade server that consumes
/// entries from it. Guarded by a mutex per §5 ("short critical sections
/// only"); `papaya` would be overkill for a table this short-lived and
/// low-contention compared to the per-pod lock registry in [`Engine`].
pub struct StreamingManager {
    sessions: StdMutex<HashMap<SessionId, StreamingSession>>,
    engine: std::sync::Arc<Engine>,
    advertise_addr: String,
}

impl StreamingManager {
    pub fn new(engine: std::sync::Arc<Engine>, advertise_addr: String) -> Self {
        StreamingManager {
            sessions: StdMutex::new(HashMap::new()),
            engine,
            advertise_addr,
        }
    }

    fn register(&self, kind: SessionKind, target: SessionTarget, command: Vec<String>, tty: bool, stdin: bool, ports: Vec<u16>) -> String {
        let id = SessionId::new();
        let session = StreamingSession {
            id,
            kind,
            target,
            command,
            tty,
            stdin,
            ports,
            created_at: now(),
        };
        self.sessions.lock().unwrap().insert(id, session);
        let path = match kind {
            SessionKind::Exec => "exec",
            SessionKind::Attach => "attach",
            SessionKind::PortForward => "portforward",
        };
        format!("http://{}/{}/{}", self.advertise_addr, path, id)
    }

    pub fn register_exec(&self, container_id: ContainerId, command: Vec<String>, tty: bool, stdin: bool) -> String {
        self.register(SessionKind::Exec, SessionTarget::Container(container_id), command, tty, stdin, Vec::new())
    }

    pub fn register_attach(&self, container_id: ContainerId, tty: bool, stdin: bool) -> String {
        self.register(SessionKind::Attach, SessionTarget::Container(container_id), Vec::new(), tty, stdin, Vec::new())
    }

    pub fn register_port_forward(&self, pod_id: PodId, ports: Vec<u16>) -> String {
        self.register(SessionKind::PortForward, SessionTarget::Pod(pod_id), Vec::new(), false, false, ports)
    }

    fn take(&self, id: SessionId) -> Option<StreamingSession> {
        self.sessions.lock().unwrap().remove(&id)
    }

    /// `ExecSync`: runs the namespace-entering command directly, without
    /// registering a session or going through the HTTP upgrade path.
    pub async fn exec_sync(&self, container_id: ContainerId, command: Vec<String>, timeout: Duration) -> Result<(i32, Vec<u8>, Vec<u8>)> {
        let record = self.engine.get_container(container_id)?;
        let pid = record
            .pid
            .ok_or_else(|| RuntimeError::invalid_state("container has no recorded PID"))?;

        let mut child = spawn_in_namespaces(pid, &command, record.working_dir.as_deref())?;
        let stdout_handle = child.stdout.take();
        let stderr_handle = child.stderr.take();

        let wait = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            if let Some(mut out) = stdout_handle {
                let _ = out.read_to_end(&mut stdout).await;
            }
            if let Some(mut err) = stderr_handle {
                let _ = err.read_to_end(&mut stderr).await;
            }
            let status = child.wait().await.map_err(|error| {
                RuntimeError::dependency(Dependency::ExecFailed, format!("exec wait failed: {error}"))
            })?;
            Ok::<_, RuntimeError>((status.code().unwrap_or(-1), stdout, stderr))
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                let _ = child.start_kill();
                Err(RuntimeError::timeout("exec did not complete before the deadline"))
            }
        }
    }

    /// Runs the upgrade server forever. Intended to be spawned as its own
    /// task alongside the gRPC `tonic::Server`.
    pub async fn serve(self: std::sync::Arc<Self>, addr: std::net::SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await.map_err(|error| {
            RuntimeError::dependency(
                Dependency::ExecFailed,
                format!("failed to bind streaming listener on {addr}: {error}"),
            )
        })?;
        log_info_globally_streaming(addr);

        loop {
            let (stream, _) = listener.accept().await.map_err(|error| {
                RuntimeError::dependency(Dependency::ExecFailed, format!("accept failed: {error}"))
            })?;
            let manager = self.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let manager = manager.clone();
                    async move { manager.handle(req).await }
                });
                if let Err(error) = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    log_warn_globally_streaming(&error.to_string());
                }
            });
        }
    }

    async fn handle(
        self: std::sync::Arc<Self>,
        mut req: Request<Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        let path = req.uri().path().to_string();
        let Some((kind, id)) = parse_session_path(&path) else {
            return Ok(not_found());
        };
        let Ok(session_id) = id.parse::<SessionId>() else {
            return Ok(not_found());
        };
        let Some(session) = self.take(session_id) else {
            return Ok(not_found());
        };
        if session.kind != kind {
            return Ok(not_found());
        }

        let on_upgrade = hyper::upgrade::on(&mut req);

        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        response
            .headers_mut()
            .insert(UPGRADE, HeaderValue::from_static("SPDY/3.1"));
        response.headers_mut().insert(
            "X-Stream-Protocol-Version",
            HeaderValue::from_static(STREAM_PROTOCOL),
        );

        let manager = self.clone();
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    if let Err(error) = manager.pump(upgraded, session).await {
                        log_warn_globally_streaming(&error.to_string());
                    }
                }
                Err(error) => log_warn_globally_streaming(&error.to_string()),
            }
        });

        Ok(response)
    }

    async fn pump(&self, upgraded: hyper::upgrade::Upgraded, session: StreamingSession) -> Result<()> {
        let mut io = TokioIo::new(upgraded);
        match session.kind {
            SessionKind::Exec | SessionKind::Attach => {
                let container_id = match session.target {
                    SessionTarget::Container(id) => id,
                    SessionTarget::Pod(_) => {
                        return Err(RuntimeError::invalid_argument("exec/attach session missing a container target"))
                    }
                };
                let record = self.engine.get_container(container_id)?;
                let pid = record
                    .pid
                    .ok_or_else(|| RuntimeError::invalid_state("container has no recorded PID"))?;
                let command = if session.command.is_empty() {
                    vec!["/bin/sh".to_string()]
                } else {
                    session.command.clone()
                };
                let child = spawn_in_namespaces(pid, &command, record.working_dir.as_deref())?;
                pump_process(&mut io, child).await
            }
            SessionKind::PortForward => {
                let pod_id = match session.target {
                    SessionTarget::Pod(id) => id,
                    SessionTarget::Container(_) => {
                        return Err(RuntimeError::invalid_argument("port-forward session missing a pod target"))
                    }
                };
                let port = *session.ports.first().ok_or_else(|| {
                    RuntimeError::invalid_argument("port-forward session carries no ports")
                })?;
                let pid = self
                    .engine
                    .pod_main_pid(pod_id)
                    .await?
                    .ok_or_else(|| RuntimeError::invalid_state("pod sandbox has no recorded PID"))?;
                let child = spawn_port_forward(pid, port)?;
                pump_process(&mut io, child).await
            }
        }
    }
}

fn now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn not_found() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(b"not found")));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

fn parse_session_path(path: &str) -> Option<(SessionKind, &str)> {
    let trimmed = path.trim_start_matches('/');
    let (prefix, id) = trimmed.split_once('/')?;
    let kind = match prefix {
        "exec" => SessionKind::Exec,
        "attach" => SessionKind::Attach,
        "portforward" => SessionKind::PortForward,
        _ => return None,
    };
    Some((kind, id))
}

/// Spawns `argv` as a child that enters `pid`'s mount/UTS/IPC/network/PID
/// namespaces plus its root and working directory, per §4.8. PID-namespace
/// entry via `setns` only takes effect for the *next* descendant the calling
/// thread forks, which is exactly what `Command::spawn`'s fork does here.
fn spawn_in_namespaces(pid: u32, argv: &[String], working_dir: Option<&str>) -> Result<Child> {
    let program = resolve_command(argv.first().map(String::as_str).unwrap_or("sh"));
    let args: Vec<String> = argv.iter().skip(1).cloned().collect();

    let mut command = Command::new(&program);
    command
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let work_dir = working_dir.map(str::to_string);
    unsafe {
        command.pre_exec(move || {
            enter_namespaces(pid)?;
            if let Some(dir) = &work_dir {
                std::env::set_current_dir(dir)?;
            }
            Ok(())
        });
    }

    command.spawn().map_err(|error| {
        RuntimeError::dependency(Dependency::ExecFailed, format!("failed to spawn {program:?} in namespace of pid {pid}: {error}"))
    })
}

/// Opens a TCP connection to `127.0.0.1:{port}` inside the pod's network
/// namespace and shuttles bytes to/from stdin/stdout, per §4.8's
/// port-forward description.
fn spawn_port_forward(pid: u32, port: u16) -> Result<Child> {
    let mut command = Command::new("/bin/sh");
    command
        .arg("-c")
        .arg(format!(
            "exec /usr/bin/env -i /bin/sh -c 'exec 3<>/dev/tcp/127.0.0.1/{port} && cat <&3 & cat >&3'"
        ))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let ns_dir = format!("/proc/{pid}/ns");
    unsafe {
        command.pre_exec(move || enter_network_namespace(&ns_dir));
    }

    command.spawn().map_err(|error| {
        RuntimeError::dependency(Dependency::ExecFailed, format!("failed to spawn port-forward shuttle on port {port}: {error}"))
    })
}

fn enter_network_namespace(ns_dir: &str) -> std::io::Result<()> {
    use nix::sched::{setns, CloneFlags};

    let file = std::fs::File::open(format!("{ns_dir}/net"))?;
    setns(file.as_raw_fd(), CloneFlags::empty()).map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
}

/// Enters the five namespaces at `/proc/{pid}/ns/{mnt,uts,ipc,net,pid}`, in
/// an order that keeps `mnt` last so the open file descriptors for the other
/// namespace files are resolved before any mount-namespace switch, then
/// `chroot`s into `/proc/{pid}/root` and `chdir`s to `/` so the spawned
/// process resolves paths against the container's rootfs, not the host's.
fn enter_namespaces(pid: u32) -> std::io::Result<()> {
    use nix::sched::{setns, CloneFlags};
    use nix::unistd::{chdir, chroot};

    let ns_dir = format!("/proc/{pid}/ns");
    for name in ["uts", "ipc", "net", "pid", "mnt"] {
        let path = format!("{ns_dir}/{name}");
        let file = std::fs::File::open(&path)?;
        setns(file.as_raw_fd(), CloneFlags::empty())
            .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
    }
    chroot(format!("/proc/{pid}/root").as_str())
        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
    chdir("/").map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
}

/// Bidirectional pump: client frames dispatched by type byte, child bytes
/// framed back with the correct type byte. Exits on client HUP, child
/// stderr HUP, or an unrecoverable read/write error; always closes the
/// child's stdin to signal EOF on the way out.
async fn pump_process<S>(socket: &mut S, mut child: Child) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut child_stdin = child.stdin.take();
    let mut child_stdout = child.stdout.take();
    let mut child_stderr = child.stderr.take();

    let mut client_buf = [0u8; 8192];
    let mut stdout_buf = [0u8; 8192];
    let mut stderr_buf = [0u8; 8192];

    loop {
        tokio::select! {
            read = socket.read(&mut client_buf) => {
                let n = read.map_err(io_error)?;
                if n == 0 {
                    break;
                }
                let frame_type = client_buf[0];
                let payload = &client_buf[1..n];
                match frame_type {
                    FRAME_STDIN => {
                        if let Some(stdin) = child_stdin.as_mut() {
                            if stdin.write_all(payload).await.is_err() {
                                child_stdin = None;
                            }
                        }
                    }
                    FRAME_RESIZE => {} // ignored unless a PTY is allocated
                    FRAME_CLOSE => break,
                    _ => {}
                }
            }
            read = read_or_pending(&mut child_stdout, &mut stdout_buf) => {
                match read {
                    Some(Ok(0)) | None => { child_stdout = None; }
                    Some(Ok(n)) => write_frame(socket, FRAME_STDOUT, &stdout_buf[..n]).await?,
                    Some(Err(_)) => break,
                }
            }
            read = read_or_pending(&mut child_stderr, &mut stderr_buf) => {
                match read {
                    Some(Ok(0)) | None => break,
                    Some(Ok(n)) => write_frame(socket, FRAME_STDERR, &stderr_buf[..n]).await?,
                    Some(Err(_)) => break,
                }
            }
            status = child.wait() => {
                let _ = status;
                break;
            }
        }
    }

    drop(child_stdin);
    let _ = child.wait().await;
    Ok(())
}

async fn read_or_pending(
    handle: &mut Option<impl tokio::io::AsyncRead + Unpin>,
    buf: &mut [u8],
) -> Option<std::io::Result<usize>> {
    match handle {
        Some(stream) => Some(stream.read(buf).await),
        None => std::future::pending().await,
    }
}

async fn write_frame<S>(socket: &mut S, frame_type: u8, payload: &[u8]) -> Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    socket.write_all(&[frame_type]).await.map_err(io_error)?;
    socket.write_all(payload).await.map_err(io_error)?;
    Ok(())
}

fn io_error(error: std::io::Error) -> RuntimeError {
    RuntimeError::new(ErrorKind::Dependency(Dependency::ExecFailed), error.to_string())
}

fn log_info_globally_streaming(addr: std::net::SocketAddr) {
    crate::log_info_globally!("streaming session manager listening on {addr}");
}

fn log_warn_globally_streaming(message: &str) {
    tracing::warn!("{message}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_resolves_bare_names() {
        assert_eq!(resolve_command("sh"), "/bin/sh");
        assert_eq!(resolve_command("id"), "/usr/bin/id");
    }

    #[test]
    fn allow_list_falls_back_to_bin_prefix() {
        assert_eq!(resolve_command("curl"), "/bin/curl");
    }

    #[test]
    fn absolute_paths_pass_through() {
        assert_eq!(resolve_command("/opt/bin/tool"), "/opt/bin/tool");
    }

    #[test]
    fn session_path_parses_kind_and_id() {
        let (kind, id) = parse_session_path("/exec/abc-123").unwrap();
        assert_eq!(kind, SessionKind::Exec);
        assert_eq!(id, "abc-123");

        assert!(parse_session_path("/unknown/abc").is_none());
    }
}
