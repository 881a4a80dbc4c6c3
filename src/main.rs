//! Entrypoint to the systemd-backed CRI runtime.
//!
//! A single instance of this binary runs per node and services the Kubelet
//! over gRPC on a local Unix socket, while exposing two auxiliary TCP
//! endpoints: exec/attach/portforward streaming and Prometheus metrics.

use std::error::Error as StdError;
use std::fs::{create_dir_all, remove_file, set_permissions, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::result::Result as StdResult;

use clap::Parser;
use futures::FutureExt;
use tokio::net::UnixListener;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::Level;

use systemd_cri::api::v1::image_service_server::ImageServiceServer;
use systemd_cri::api::v1::runtime_service_server::RuntimeServiceServer;
use systemd_cri::bus::BusClient;
use systemd_cri::config::Config;
use systemd_cri::cri::{CriImageService, CriRuntimeService, CONTAINER_RUNTIME_NAME};
use systemd_cri::runtime::Runtime;
use systemd_cri::{log_info_globally, metrics, notify};

/// Socket mode per the runtime socket contract.
const SOCKET_MODE: u32 = 0o660;

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Level {
        match level {
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[derive(Parser)]
#[command(name = CONTAINER_RUNTIME_NAME, version)]
struct Args {
    /// Path of the Unix-domain socket serving the CRI services.
    /// Defaults to `$RUNTIME_DIRECTORY/cri.sock`.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// State directory. Defaults to `$STATE_DIRECTORY`.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// TCP port of the exec/attach/portforward streaming endpoint.
    #[arg(long, default_value_t = 10110)]
    streaming_port: u16,

    /// Host placed in streaming URLs handed to the Kubelet.
    #[arg(long, default_value = "127.0.0.1")]
    streaming_host: String,

    /// TCP port of the Prometheus metrics endpoint.
    #[arg(long, default_value_t = 9615)]
    metrics_port: u16,

    /// Directory containing CNI plugin binaries.
    #[arg(long, default_value = "/opt/cni/bin")]
    cni_plugin_dir: PathBuf,

    /// CNI plugin wiring pod network namespaces.
    #[arg(long, default_value = "bridge")]
    cni_plugin: String,

    /// CIDR from which pod addresses are allocated.
    #[arg(long, default_value = "10.88.0.0/16")]
    pod_cidr: String,

    /// External image fetcher. Invoked as
    /// `<fetcher> <ref> <oci-dir> <rootfs-tar>`.
    #[arg(long, default_value = "/usr/libexec/systemd-cri/fetch")]
    fetcher: PathBuf,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> StdResult<(), Box<dyn StdError>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .json()
        .with_max_level(Level::from(args.log_level))
        .init();

    let config = Config::resolve(
        args.socket,
        args.state_dir,
        args.streaming_port,
        args.streaming_host,
        args.metrics_port,
        args.cni_plugin_dir,
        args.cni_plugin,
        args.pod_cidr,
        args.fetcher,
    );

    let bus = BusClient::system().await?;
    let runtime = Runtime::new(&config, bus)?;
    runtime.recover().await?;

    // systemd sends SIGTERM to stop services, CTRL+C sends SIGINT.
    // Listen for those to shut down the servers gracefully.
    let mut sigterm = signal(SignalKind::terminate())
        .unwrap_or_else(|err| panic!("Cannot listen for SIGTERM: {err}"));
    let mut sigint = signal(SignalKind::interrupt())
        .unwrap_or_else(|err| panic!("Cannot listen for SIGINT: {err}"));
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let shutdown_signal = async move {
        select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        notify::stopping();
        // Re-broadcast the shutdown signal to the auxiliary servers
        // (best effort).
        let _ = shutdown_tx.send(());
    };
    let auxiliary_shutdown = shutdown_rx.shared();

    tokio::task::spawn(metrics::serve(
        config.metrics_port,
        runtime.metrics.registry.clone(),
        runtime.metrics.runtime_ready.clone(),
        auxiliary_shutdown.clone().map(|_| ()),
    ));
    tokio::task::spawn(
        runtime
            .streaming
            .clone()
            .serve(config.streaming_port, auxiliary_shutdown.map(|_| ())),
    );
    tokio::task::spawn(runtime.streaming.clone().sweep_expired());

    // Bind the CRI socket last, so any failure before this point leaves no
    // stale socket behind; after this point the socket is unlinked on the
    // way out so the service can restart cleanly.
    if let Some(parent) = Path::new(&config.socket_path).parent() {
        create_dir_all(parent)?;
    }
    let _ = remove_file(&config.socket_path);
    let cri_listener = UnixListener::bind(&config.socket_path)?;
    set_permissions(&config.socket_path, Permissions::from_mode(SOCKET_MODE))?;

    runtime.metrics.runtime_ready.set(1);
    notify::ready();
    log_info_globally!(socket = %config.socket_path.display(), "Runtime ready");

    let result = Server::builder()
        .add_service(RuntimeServiceServer::new(CriRuntimeService(runtime.clone())))
        .add_service(ImageServiceServer::new(CriImageService(runtime)))
        .serve_with_incoming_shutdown(UnixListenerStream::new(cri_listener), shutdown_signal)
        .await;

    // Remove the UDS path after shutdown so we can rebind on restart.
    // Do this before propagating potential CRI API server errors.
    let unlink_socket_result = remove_file(&config.socket_path);

    result?;
    Ok(unlink_socket_result?)
}
