//! Entrypoint to the systemd-backed CRI runtime.
//!
//! A single instance of this binary runs on each node and serves the
//! Kubernetes `RuntimeService`/`ImageService` gRPC surface, by default over
//! the Unix-domain socket kubelet is configured to dial.

mod cni;
mod command;
mod cri;
mod engine;
mod error;
mod ids;
mod image_ref;
mod logging;
mod names;
mod overlay;
mod pool;
mod puller;
mod store;
mod streaming;
mod systemd;

use std::fs::{create_dir_all, remove_file};
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::result::Result as StdResult;
use std::sync::Arc;

use clap::Parser;
use tokio::net::UnixListener;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

use api_proto::runtime::v1::image_service_server::ImageServiceServer;
use api_proto::runtime::v1::runtime_service_server::RuntimeServiceServer;

use cni::CniDriver;
use command::TokioCommandRunner;
use cri::CriService;
use engine::Engine;
use pool::MachinedClient;
use puller::ImagePuller;
use store::{SledStore, Store};
use streaming::StreamingManager;
use systemd::SystemdClient;

const DEFAULT_LISTEN_ADDR: &str = "unix:///run/systemd/cri/cri.sock";
const DEFAULT_STREAMING_ADDR: &str = "127.0.0.1:0";

#[derive(Parser)]
#[command(name = "runtime", version)]
struct Args {
    /// Tracing `EnvFilter` directive, e.g. `debug`, `info`, `warn`, `err`.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Address kubelet connects to: `unix://<path>`, `tcp://host:port`, or a
    /// bare `host:port` (interpreted as TCP).
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    listen_addr: String,

    /// Root of the persisted state layout (`state.db/`, `containers/`,
    /// `tmp/`, `images/`). Falls back to `$STATE_DIRECTORY` when empty,
    /// matching systemd's own `StateDirectory=` unit convention.
    #[arg(long, default_value = "")]
    state_dir: String,

    /// Directory CNI config files (`.conf`/`.conflist`/`.json`) are loaded
    /// from.
    #[arg(long, default_value = "/etc/cni/net.d")]
    cni_conf_dir: String,

    /// Colon-joined search path for CNI plugin binaries, overriding the
    /// built-in default list.
    #[arg(long)]
    cni_bin_dir: Option<String>,

    /// Address the exec/attach/port-forward streaming server binds and
    /// advertises in the URLs it hands back to kubelet.
    #[arg(long, default_value = DEFAULT_STREAMING_ADDR)]
    streaming_addr: String,
}

enum ListenOn {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

/// Parses `--listen-addr` per the accepted forms: `unix://<path>`,
/// `tcp://host:port`, or a bare `host:port` (a colon with no scheme means
/// TCP).
fn parse_listen_addr(addr: &str) -> anyhow::Result<ListenOn> {
    if let Some(path) = addr.strip_prefix("unix://") {
        return Ok(ListenOn::Unix(PathBuf::from(path)));
    }
    if let Some(host_port) = addr.strip_prefix("tcp://") {
        return Ok(ListenOn::Tcp(host_port.parse()?));
    }
    if addr.contains(':') {
        return Ok(ListenOn::Tcp(addr.parse()?));
    }
    Ok(ListenOn::Unix(PathBuf::from(addr)))
}

fn resolve_state_dir(flag: &str) -> anyhow::Result<PathBuf> {
    if !flag.is_empty() {
        return Ok(PathBuf::from(flag));
    }
    if let Ok(dir) = std::env::var("STATE_DIRECTORY") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    anyhow::bail!("--state-dir was not given and $STATE_DIRECTORY is unset")
}

#[tokio::main]
async fn main() -> StdResult<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let _logger_provider = logging::init(&args.log_level)?;

    if let Err(error) = run(args).await {
        log_error_globally!("runtime exited with an error: {error:#}");
        return Err(error.into());
    }
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let state_dir = resolve_state_dir(&args.state_dir)?;
    create_dir_all(&state_dir)?;
    create_dir_all(state_dir.join("containers"))?;
    create_dir_all(state_dir.join("tmp"))?;
    create_dir_all(state_dir.join("images"))?;

    let kv = SledStore::open(&state_dir.join("state.db"))?;
    let store = Arc::new(Store::new(Box::new(kv)));

    let systemd = Arc::new(SystemdClient::connect().await?);
    let pool = Arc::new(MachinedClient::connect().await?);
    let commands = Arc::new(TokioCommandRunner);

    let bin_dirs = args
        .cni_bin_dir
        .as_deref()
        .map(|dirs| dirs.split(':').map(PathBuf::from).collect());
    let cni = Arc::new(match bin_dirs {
        Some(dirs) => CniDriver::new(PathBuf::from(&args.cni_conf_dir), dirs),
        None => CniDriver::with_default_plugin_dirs(PathBuf::from(&args.cni_conf_dir)),
    });

    let puller = ImagePuller {
        scratch_dir: state_dir.join("tmp"),
        ..ImagePuller::default()
    };

    let engine = Arc::new(Engine::new(
        store,
        systemd,
        pool,
        commands,
        cni,
        puller,
        state_dir.clone(),
    ));

    let streaming = Arc::new(StreamingManager::new(engine.clone(), args.streaming_addr.clone()));
    let streaming_addr: SocketAddr = args.streaming_addr.parse()?;
    let streaming_task = {
        let streaming = streaming.clone();
        tokio::spawn(async move {
            if let Err(error) = streaming.serve(streaming_addr).await {
                log_error_globally!("streaming server exited: {error}");
            }
        })
    };

    let service = Arc::new(CriService::new(engine, streaming));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let (shutdown_tx, _shutdown_rx) = oneshot::channel::<()>();
    let shutdown_signal = async move {
        select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        // Best-effort: nothing currently subscribes, but this keeps the
        // door open for a future component that needs to know.
        let _ = shutdown_tx.send(());
    };

    let server = Server::builder()
        .add_service(RuntimeServiceServer::from_arc(service.clone()))
        .add_service(ImageServiceServer::from_arc(service));

    let result = match parse_listen_addr(&args.listen_addr)? {
        ListenOn::Unix(path) => {
            if let Some(parent) = path.parent() {
                create_dir_all(parent)?;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o755))?;
            }
            let _ = remove_file(&path);
            let listener = UnixListener::bind(&path)?;
            log_info_globally!("listening on unix://{}", path.display());

            let serve_result = server
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown_signal)
                .await;
            let unlink_result = remove_file(&path);
            serve_result?;
            unlink_result.map_err(anyhow::Error::from)
        }
        ListenOn::Tcp(addr) => {
            log_info_globally!("listening on tcp://{addr}");
            server
                .serve_with_shutdown(addr, shutdown_signal)
                .await
                .map_err(anyhow::Error::from)
        }
    };

    streaming_task.abort();
    result
}
