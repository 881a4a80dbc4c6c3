//! Message-bus client shared by the service-manager and machined wrappers.
//!
//! Bus calls are naturally blocking from the caller's point of view: a worker
//! awaits the reply before continuing. Transient transport failures are
//! retried with bounded exponential backoff up to the caller's deadline;
//! remote method errors are propagated verbatim with the bus error name
//! preserved in the status message.
//!
//! Where a caller must observe a signal emitted as a consequence of a method
//! call (a service-manager job finishing, a machined transfer completing),
//! the subscription is opened *before* the call so no wakeup can be lost.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::{sleep, timeout, Instant};
use zbus::{Connection, MatchRule, Message, MessageStream};

use crate::error::{Code, Result, Status};
use crate::log_error_status;

/// Deadline applied to bus calls whose caller did not supply one.
pub const DEFAULT_CALL_DEADLINE: Duration = Duration::from_secs(25);

/// First retry delay after a transient transport failure.
const BACKOFF_INITIAL: Duration = Duration::from_millis(50);

/// Retry delays stop growing here.
const BACKOFF_CEILING: Duration = Duration::from_secs(2);

/// Signal messages queued per subscription before the bus connection
/// applies backpressure.
const SIGNAL_QUEUE_DEPTH: usize = 64;

/// A cheap, cloneable handle to a shared bus connection.
///
/// The underlying [`Connection`] serializes outgoing traffic internally, so a
/// single handle may be used concurrently from many tasks.
#[derive(Clone)]
pub struct BusClient {
    connection: Connection,
}

impl BusClient {
    /// Connect to the system bus (the production configuration).
    pub async fn system() -> Result<Self> {
        Ok(BusClient {
            connection: Connection::system()
                .await
                .map_err(log_error_status!(Code::Unavailable, "bus-connect-failed"))?,
        })
    }

    /// Connect to the per-user session bus. Used by tests that run against a
    /// user service manager instead of pid 1.
    pub async fn session() -> Result<Self> {
        Ok(BusClient {
            connection: Connection::session()
                .await
                .map_err(log_error_status!(Code::Unavailable, "bus-connect-failed"))?,
        })
    }

    /// The connection's unique name on the bus, if the handshake assigned one.
    pub fn unique_name(&self) -> Option<String> {
        self.connection.unique_name().map(|name| name.to_string())
    }

    /// Call a method and await the reply, retrying transient transport
    /// failures with exponential backoff until `deadline` elapses.
    ///
    /// `body` must serialize to the method's input signature. Remote errors
    /// are not retried; their bus error name is preserved in the returned
    /// status.
    pub async fn call<B>(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        method: &str,
        body: &B,
        deadline: Duration,
    ) -> Result<Arc<Message>>
    where
        B: serde::ser::Serialize + zvariant::DynamicType,
    {
        let started = Instant::now();
        let mut backoff = BACKOFF_INITIAL;
        loop {
            let remaining = deadline
                .checked_sub(started.elapsed())
                .filter(|remaining| !remaining.is_zero())
                .ok_or_else(|| Status::new(Code::DeadlineExceeded, "bus-call-deadline"))?;

            let call = self.connection.call_method(
                Some(destination),
                path,
                Some(interface),
                method,
                body,
            );
            match timeout(remaining, call).await {
                Err(_elapsed) => {
                    return Err(Status::new(Code::DeadlineExceeded, "bus-call-deadline"))
                }
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(error)) if is_transient(&error) => {
                    if started.elapsed() + backoff >= deadline {
                        return Err(Status::new(Code::Unavailable, "bus-unreachable"));
                    }
                    sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, BACKOFF_CEILING);
                }
                Ok(Err(error)) => return Err(remote_error_status(error)),
            }
        }
    }

    /// Subscribe to the messages selected by `rule`.
    ///
    /// The match is registered on the bus before this returns, so signals
    /// emitted by calls made afterwards cannot be missed.
    pub async fn subscribe(&self, rule: MatchRule<'static>) -> Result<MessageStream> {
        MessageStream::for_match_rule(rule, &self.connection, Some(SIGNAL_QUEUE_DEPTH))
            .await
            .map_err(log_error_status!(Code::Unavailable, "bus-subscribe-failed"))
    }

    /// Subscribe to `rule`, perform the method call, then wait for the signal
    /// that completes the operation.
    ///
    /// `select` inspects (reply, signal) pairs; the first signal for which it
    /// returns `Some` completes the wait. The whole sequence shares one
    /// deadline.
    pub async fn call_with_completion<B, T, S>(
        &self,
        rule: MatchRule<'static>,
        destination: &str,
        path: &str,
        interface: &str,
        method: &str,
        body: &B,
        select: S,
        deadline: Duration,
    ) -> Result<T>
    where
        B: serde::ser::Serialize + zvariant::DynamicType,
        S: Fn(&Message, &Message) -> Option<T>,
    {
        let started = Instant::now();
        let mut signals = self.subscribe(rule).await?;
        let reply = self
            .call(destination, path, interface, method, body, deadline)
            .await?;

        loop {
            let remaining = deadline
                .checked_sub(started.elapsed())
                .filter(|remaining| !remaining.is_zero())
                .ok_or_else(|| Status::new(Code::DeadlineExceeded, "bus-signal-deadline"))?;

            match timeout(remaining, signals.next()).await {
                Err(_elapsed) => {
                    return Err(Status::new(Code::DeadlineExceeded, "bus-signal-deadline"))
                }
                Ok(None) => return Err(Status::new(Code::Unavailable, "bus-stream-closed")),
                Ok(Some(Err(error))) if is_transient(&error) => continue,
                Ok(Some(Err(error))) => return Err(remote_error_status(error)),
                Ok(Some(Ok(signal))) => {
                    if let Some(value) = select(&reply, &signal) {
                        return Ok(value);
                    }
                }
            }
        }
    }
}

/// True for failures of the transport itself, which are worth retrying.
/// Remote method errors are never transient: the call reached the peer.
fn is_transient(error: &zbus::Error) -> bool {
    matches!(error, zbus::Error::InputOutput(_))
}

/// Convert a non-transient bus error to a status, keeping the remote error
/// name verbatim so operators can correlate with peer logs.
fn remote_error_status(error: zbus::Error) -> Status {
    match error {
        zbus::Error::MethodError(name, message, _) => {
            let code = code_for_bus_error(name.as_str());
            match message {
                Some(message) => Status::new(code, format!("{}: {message}", name.as_str())),
                None => Status::new(code, name.as_str().to_owned()),
            }
        }
        other => Status::new(Code::Unavailable, format!("bus-transport: {other}")),
    }
}

/// Map well-known bus error names onto the gRPC status vocabulary.
fn code_for_bus_error(name: &str) -> Code {
    match name {
        "org.freedesktop.systemd1.NoSuchUnit"
        | "org.freedesktop.machine1.NoSuchImage"
        | "org.freedesktop.machine1.NoSuchMachine"
        | "org.freedesktop.DBus.Error.UnknownObject"
        | "org.freedesktop.DBus.Error.UnknownMethod" => Code::NotFound,
        "org.freedesktop.systemd1.UnitExists" => Code::AlreadyExists,
        "org.freedesktop.DBus.Error.AccessDenied" => Code::PermissionDenied,
        "org.freedesktop.DBus.Error.InvalidArgs" => Code::InvalidArgument,
        "org.freedesktop.DBus.Error.NoReply"
        | "org.freedesktop.DBus.Error.Timeout"
        | "org.freedesktop.DBus.Error.TimedOut" => Code::DeadlineExceeded,
        "org.freedesktop.DBus.Error.ServiceUnknown"
        | "org.freedesktop.DBus.Error.NameHasNoOwner"
        | "org.freedesktop.DBus.Error.LimitsExceeded" => Code::Unavailable,
        _ => Code::Internal,
    }
}

/// True if a status carries the given remote error name.
/// Useful for idempotent operations where a missing peer object is success.
pub fn is_bus_error(status: &Status, name: &str) -> bool {
    status.message().starts_with(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_mapping_not_found() {
        assert_eq!(
            code_for_bus_error("org.freedesktop.systemd1.NoSuchUnit"),
            Code::NotFound,
        );
    }

    #[test]
    fn code_mapping_unknown_names_are_internal() {
        assert_eq!(code_for_bus_error("com.example.Novel"), Code::Internal);
    }

    #[test]
    fn remote_errors_keep_the_bus_error_name() {
        let name = zbus::names::OwnedErrorName::try_from("org.freedesktop.systemd1.NoSuchUnit")
            .unwrap();
        let message = zbus::MessageBuilder::signal("/", "com.example.Iface", "Member")
            .unwrap()
            .build(&())
            .unwrap();
        let status = remote_error_status(zbus::Error::MethodError(
            name,
            Some(String::from("Unit cri-pod-x.scope not loaded.")),
            Arc::new(message),
        ));

        assert_eq!(status.code(), Code::NotFound);
        assert!(is_bus_error(&status, "org.freedesktop.systemd1.NoSuchUnit"));
    }
}
