//! Error handling for the runtime.
//!
//! All processes performed by the runtime are initiated with a gRPC call from
//! Kubelet &mdash; to either `runtime.v1.RuntimeService` or
//! `runtime.v1.ImageService` &mdash; so errors can always be reported in one
//! of two ways:
//! 1. As a gRPC error status response to Kubelet.
//! 2. To the runtime logs (`journalctl -u systemd-cri`).
//!
//! End users do not interact with the runtime directly; the Kubelet is the
//! intended audience for error messages.
//!
//! In light of all this, follow these error-handling practices:
//! - Any fallible method should return `Result<_, Status>`
//!   for easy fail-fast checks (`?`) down all call stacks.
//! - All error statuses must include a short, simple, unique, static message
//!   *e.g.* `pod-scope-start-failed`, with a descriptive status code.
//!   This information ends up in Kubelet logs and is mainly useful to
//!   correlate those statuses with source code logic and the runtime logs.
//! - Any other relevant information must be logged using the macros in
//!   [`crate::logging`], with a `tag` field carrying the same short static
//!   message that was returned in the status.
//!   See *e.g.* [`log_error_status`](crate::log_error_status) for a macro
//!   that combines the two.

use std::result::Result as StdResult;

pub use tonic::{Code, Status};

/// Shorthand for results with [`Status`] error types.
pub type Result<T> = StdResult<T, Status>;

/// Expands to a closure suitable for `map_err` / `ok_or_else` that logs the
/// irritant (tagged with the pod or container id when one is in scope) and
/// produces a [`Status`] whose message is the same static tag.
///
/// The context-free forms default to [`Code::Internal`].
#[macro_export]
macro_rules! log_error_status {
    (pod: $pod:expr, $code:expr, $target:expr) => {
        |irritant| {
            $crate::log_error!(pod: $pod, tag = $target, "{:?}", irritant);
            $crate::error::Status::new($code, $target)
        }
    };
    (container: $container:expr, $code:expr, $target:expr) => {
        |irritant| {
            $crate::log_error!(container: $container, tag = $target, "{:?}", irritant);
            $crate::error::Status::new($code, $target)
        }
    };
    (pod: $pod:expr, $target:expr) => {
        $crate::log_error_status!(pod: $pod, $crate::error::Code::Internal, $target)
    };
    (container: $container:expr, $target:expr) => {
        $crate::log_error_status!(container: $container, $crate::error::Code::Internal, $target)
    };
    ($code:expr, $target:expr) => {
        |irritant| {
            $crate::log_error_globally!(tag = $target, "{:?}", irritant);
            $crate::error::Status::new($code, $target)
        }
    };
    ($target:expr) => {
        $crate::log_error_status!($crate::error::Code::Internal, $target)
    };
}
