//! Service-manager readiness notifications.
//!
//! The runtime is declared `Type=notify`: it reports `READY=1` once the
//! sockets are listening and `STOPPING=1` when shutdown begins. Messages are
//! datagrams to `$NOTIFY_SOCKET`; when the variable is unset (running
//! outside the service manager) notification is a silent no-op.

use std::env;
use std::io;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};

use crate::log_warn_globally;

/// Report startup complete.
pub fn ready() {
    send(&["READY=1"]);
}

/// Report shutdown beginning.
pub fn stopping() {
    send(&["READY=0", "STOPPING=1"]);
}

fn send(states: &[&str]) {
    if let Err(error) = try_send(states) {
        log_warn_globally!("Service-manager notification failed: {error}");
    }
}

fn try_send(states: &[&str]) -> io::Result<()> {
    let Some(socket) = env::var_os("NOTIFY_SOCKET") else {
        return Ok(());
    };
    let socket = socket
        .into_string()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "non-UTF-8 NOTIFY_SOCKET"))?;

    let payload = states.join("\n");
    let datagram = UnixDatagram::unbound()?;
    // A leading '@' selects the abstract namespace.
    if let Some(name) = socket.strip_prefix('@') {
        let address = SocketAddr::from_abstract_name(name.as_bytes())?;
        datagram.send_to_addr(payload.as_bytes(), &address)?;
    } else {
        datagram.send_to(payload.as_bytes(), &socket)?;
    }
    Ok(())
}
