//! Logging for the runtime.
//!
//! Logs are the primary debugging tool for nodes running this service.
//! All logged information must be tagged with the relevant pod or container id
//! so the logs can be filtered per workload.

/// The most basic requirements for emitting a log:
/// - Log level.
/// - Pod or container: all log messages occur in the context of a pod or
///   container id, for the purpose of organizing and filtering.
/// - Arguments: a literal format string, followed by optional irritants.
#[macro_export]
macro_rules! log {
    ($level:expr, pod: $pod:expr, $($arg:tt)+) => {{
        // Check the type of `$pod` by moving the reference.
        let pod: &str = $pod;
        ::tracing::event!($level, pod = pod, $($arg)+)
    }};
    ($level:expr, container: $container:expr, $($arg:tt)+) => {{
        // Check the type of `$container` by moving the reference.
        let container: &str = $container;
        ::tracing::event!($level, container = container, $($arg)+)
    }};
}

#[macro_export]
macro_rules! log_error {
    (pod: $pod:expr, $($arg:tt)+) => {
        $crate::log!(::tracing::Level::ERROR, pod: $pod, $($arg)+)
    };
    (container: $container:expr, $($arg:tt)+) => {
        $crate::log!(::tracing::Level::ERROR, container: $container, $($arg)+)
    };
}

/// Log an error when there really is no relevant pod or container id to use
/// as context, such as when logging so early during the life of an RPC that
/// no id has been successfully parsed.
/// Always use [`log_error`](crate::log_error) instead if possible.
#[macro_export]
macro_rules! log_error_globally {
    ($($arg:tt)+) => {
        ::tracing::event!(::tracing::Level::ERROR, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_warn {
    (pod: $pod:expr, $($arg:tt)+) => {
        $crate::log!(::tracing::Level::WARN, pod: $pod, $($arg)+)
    };
    (container: $container:expr, $($arg:tt)+) => {
        $crate::log!(::tracing::Level::WARN, container: $container, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_warn_globally {
    ($($arg:tt)+) => {
        ::tracing::event!(::tracing::Level::WARN, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_info {
    (pod: $pod:expr, $($arg:tt)+) => {
        $crate::log!(::tracing::Level::INFO, pod: $pod, $($arg)+)
    };
    (container: $container:expr, $($arg:tt)+) => {
        $crate::log!(::tracing::Level::INFO, container: $container, $($arg)+)
    };
}

/// Log normal runtime information when there really is no relevant pod or
/// container id to use as context, such as behavior relevant to the system as
/// a whole but not to any individual workload.
/// Always use [`log_info`](crate::log_info) instead if possible.
#[macro_export]
macro_rules! log_info_globally {
    ($($arg:tt)+) => {
        ::tracing::event!(::tracing::Level::INFO, $($arg)+)
    };
}
