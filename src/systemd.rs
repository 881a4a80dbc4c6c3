//! Typed client for the service manager's bus interface.
//!
//! Everything the runtime does to a unit goes through here: creating
//! transient scopes and services, stopping and killing them, and reading the
//! handful of unit properties the lifecycle managers care about.
//!
//! Job-producing methods follow the subscribe-before-call discipline: the
//! `JobRemoved` subscription is registered before `StartTransientUnit` /
//! `StopUnit` is issued, so the completion signal cannot race the reply.

use std::time::Duration;

use futures::StreamExt;
use tokio::time::{timeout, Instant};
use zbus::{MatchRule, MessageStream, MessageType};
use zvariant::{Array, OwnedObjectPath, Signature, StructureBuilder, Value};

use crate::bus::BusClient;
use crate::error::{Code, Result, Status};

const SYSTEMD_DESTINATION: &str = "org.freedesktop.systemd1";
const SYSTEMD_PATH: &str = "/org/freedesktop/systemd1";
const MANAGER_INTERFACE: &str = "org.freedesktop.systemd1.Manager";
const UNIT_INTERFACE: &str = "org.freedesktop.systemd1.Unit";
const SERVICE_INTERFACE: &str = "org.freedesktop.systemd1.Service";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Unit start/stop mode. The runtime always replaces conflicting queued jobs.
pub const UNIT_MODE_REPLACE: &str = "replace";

/// A transient unit property: name plus variant-wrapped value.
pub type UnitProperty = (&'static str, Value<'static>);

/// Result vocabulary of the manager's `JobRemoved` signal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobResult {
    Done,
    Canceled,
    Timeout,
    Failed,
    Dependency,
    Skipped,
    /// Forwards-compatibility with result strings newer than this client.
    Unknown(String),
}

impl JobResult {
    fn parse(result: &str) -> Self {
        match result {
            "done" => JobResult::Done,
            "canceled" => JobResult::Canceled,
            "timeout" => JobResult::Timeout,
            "failed" => JobResult::Failed,
            "dependency" => JobResult::Dependency,
            "skipped" => JobResult::Skipped,
            other => JobResult::Unknown(String::from(other)),
        }
    }
}

/// High-level unit activity, collapsed from the manager's `ActiveState`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ActiveState {
    Active,
    Reloading,
    Inactive,
    Failed,
    Activating,
    Deactivating,
    Unknown(String),
}

impl ActiveState {
    fn parse(state: &str) -> Self {
        match state {
            "active" => ActiveState::Active,
            "reloading" => ActiveState::Reloading,
            "inactive" => ActiveState::Inactive,
            "failed" => ActiveState::Failed,
            "activating" => ActiveState::Activating,
            "deactivating" => ActiveState::Deactivating,
            other => ActiveState::Unknown(String::from(other)),
        }
    }

    /// The unit has finished running (successfully or not).
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActiveState::Inactive | ActiveState::Failed)
    }
}

/// Which of a unit's processes receive a signal sent with
/// [`SystemdManager::kill_unit`].
#[derive(Clone, Copy, Debug)]
pub enum KillWho {
    Main,
    Control,
    All,
}

impl KillWho {
    fn as_str(self) -> &'static str {
        match self {
            KillWho::Main => "main",
            KillWho::Control => "control",
            KillWho::All => "all",
        }
    }
}

/// Client for the manager object of the host service manager.
#[derive(Clone)]
pub struct SystemdManager {
    bus: BusClient,
}

impl SystemdManager {
    pub fn new(bus: BusClient) -> Self {
        SystemdManager { bus }
    }

    /// Subscribe to `JobRemoved`. Must be called before issuing the job so
    /// the completion signal cannot be missed.
    pub async fn subscribe_job_removed(&self) -> Result<MessageStream> {
        let rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .interface(MANAGER_INTERFACE)
            .map_err(|_| Status::new(Code::Internal, "bus-match-rule"))?
            .member("JobRemoved")
            .map_err(|_| Status::new(Code::Internal, "bus-match-rule"))?
            .build();
        self.bus.subscribe(rule).await
    }

    /// `StartTransientUnit` without waiting for the job.
    /// Returns the job object path.
    pub async fn start_transient_unit(
        &self,
        name: &str,
        properties: Vec<UnitProperty>,
        deadline: Duration,
    ) -> Result<OwnedObjectPath> {
        // Aux units are a deprecated mechanism; always empty.
        let aux: Vec<(&str, Vec<UnitProperty>)> = Vec::new();
        let reply = self
            .bus
            .call(
                SYSTEMD_DESTINATION,
                SYSTEMD_PATH,
                MANAGER_INTERFACE,
                "StartTransientUnit",
                &(name, UNIT_MODE_REPLACE, properties, aux),
                deadline,
            )
            .await?;
        reply
            .body::<OwnedObjectPath>()
            .map_err(|_| Status::new(Code::Internal, "bus-reply-decode"))
    }

    /// `StartTransientUnit` with the subscribe-before-call discipline,
    /// waiting for the job to leave the queue.
    pub async fn start_transient_unit_and_wait(
        &self,
        name: &str,
        properties: Vec<UnitProperty>,
        deadline: Duration,
    ) -> Result<JobResult> {
        let started = Instant::now();
        let mut jobs = self.subscribe_job_removed().await?;
        let job = self
            .start_transient_unit(name, properties, deadline)
            .await?;
        self.wait_for_job(&mut jobs, &job, remaining(deadline, started)?)
            .await
    }

    /// `StopUnit` with the subscribe-before-call discipline.
    pub async fn stop_unit_and_wait(&self, name: &str, deadline: Duration) -> Result<JobResult> {
        let started = Instant::now();
        let mut jobs = self.subscribe_job_removed().await?;
        let reply = self
            .bus
            .call(
                SYSTEMD_DESTINATION,
                SYSTEMD_PATH,
                MANAGER_INTERFACE,
                "StopUnit",
                &(name, UNIT_MODE_REPLACE),
                deadline,
            )
            .await?;
        let job = reply
            .body::<OwnedObjectPath>()
            .map_err(|_| Status::new(Code::Internal, "bus-reply-decode"))?;
        self.wait_for_job(&mut jobs, &job, remaining(deadline, started)?)
            .await
    }

    /// Send `signal` to the chosen processes of a unit.
    pub async fn kill_unit(&self, name: &str, who: KillWho, signal: i32) -> Result<()> {
        self.bus
            .call(
                SYSTEMD_DESTINATION,
                SYSTEMD_PATH,
                MANAGER_INTERFACE,
                "KillUnit",
                &(name, who.as_str(), signal),
                crate::bus::DEFAULT_CALL_DEADLINE,
            )
            .await
            .map(|_| ())
    }

    /// Apply runtime-mutable properties to a loaded unit.
    pub async fn set_unit_properties(
        &self,
        name: &str,
        properties: Vec<UnitProperty>,
    ) -> Result<()> {
        self.bus
            .call(
                SYSTEMD_DESTINATION,
                SYSTEMD_PATH,
                MANAGER_INTERFACE,
                "SetUnitProperties",
                &(name, true, properties),
                crate::bus::DEFAULT_CALL_DEADLINE,
            )
            .await
            .map(|_| ())
    }

    /// Clear the failed state of a unit so the next start is unimpeded.
    pub async fn reset_failed_unit(&self, name: &str) -> Result<()> {
        self.bus
            .call(
                SYSTEMD_DESTINATION,
                SYSTEMD_PATH,
                MANAGER_INTERFACE,
                "ResetFailedUnit",
                &(name,),
                crate::bus::DEFAULT_CALL_DEADLINE,
            )
            .await
            .map(|_| ())
    }

    /// Object path of a loaded unit. `NoSuchUnit` maps to `NotFound`.
    pub async fn get_unit_path(&self, name: &str) -> Result<OwnedObjectPath> {
        let reply = self
            .bus
            .call(
                SYSTEMD_DESTINATION,
                SYSTEMD_PATH,
                MANAGER_INTERFACE,
                "GetUnit",
                &(name,),
                crate::bus::DEFAULT_CALL_DEADLINE,
            )
            .await?;
        reply
            .body::<OwnedObjectPath>()
            .map_err(|_| Status::new(Code::Internal, "bus-reply-decode"))
    }

    pub async fn unit_active_state(&self, name: &str) -> Result<ActiveState> {
        let path = self.get_unit_path(name).await?;
        let state: String = self
            .unit_property_string(&path, UNIT_INTERFACE, "ActiveState")
            .await?;
        Ok(ActiveState::parse(&state))
    }

    pub async fn unit_sub_state(&self, name: &str) -> Result<String> {
        let path = self.get_unit_path(name).await?;
        self.unit_property_string(&path, UNIT_INTERFACE, "SubState")
            .await
    }

    /// Main pid of a service unit, if one is running.
    pub async fn service_main_pid(&self, name: &str) -> Result<u32> {
        let path = self.get_unit_path(name).await?;
        let value = self
            .unit_property(&path, SERVICE_INTERFACE, "MainPID")
            .await?;
        u32::try_from(value).map_err(|_| Status::new(Code::Internal, "bus-property-type"))
    }

    /// Exit status of a service's main process, meaningful once it exited.
    pub async fn service_exit_status(&self, name: &str) -> Result<i32> {
        let path = self.get_unit_path(name).await?;
        let value = self
            .unit_property(&path, SERVICE_INTERFACE, "ExecMainStatus")
            .await?;
        i32::try_from(value).map_err(|_| Status::new(Code::Internal, "bus-property-type"))
    }

    /// Read a raw resource-control property of a service unit.
    pub async fn service_property_u64(&self, name: &str, property: &str) -> Result<u64> {
        let path = self.get_unit_path(name).await?;
        let value = self
            .unit_property(&path, SERVICE_INTERFACE, property)
            .await?;
        u64::try_from(value).map_err(|_| Status::new(Code::Internal, "bus-property-type"))
    }

    async fn unit_property(
        &self,
        path: &OwnedObjectPath,
        interface: &str,
        property: &str,
    ) -> Result<zvariant::OwnedValue> {
        let reply = self
            .bus
            .call(
                SYSTEMD_DESTINATION,
                path.as_str(),
                PROPERTIES_INTERFACE,
                "Get",
                &(interface, property),
                crate::bus::DEFAULT_CALL_DEADLINE,
            )
            .await?;
        reply
            .body::<zvariant::OwnedValue>()
            .map_err(|_| Status::new(Code::Internal, "bus-reply-decode"))
    }

    async fn unit_property_string(
        &self,
        path: &OwnedObjectPath,
        interface: &str,
        property: &str,
    ) -> Result<String> {
        let value = self.unit_property(path, interface, property).await?;
        String::try_from(value).map_err(|_| Status::new(Code::Internal, "bus-property-type"))
    }

    /// Wait for `JobRemoved` naming the given job.
    pub async fn wait_for_job(
        &self,
        jobs: &mut MessageStream,
        job: &OwnedObjectPath,
        deadline: Duration,
    ) -> Result<JobResult> {
        let started = Instant::now();
        loop {
            match timeout(remaining(deadline, started)?, jobs.next()).await {
                Err(_elapsed) => return Err(Status::new(Code::DeadlineExceeded, "unit-job-wait")),
                Ok(None) => return Err(Status::new(Code::Unavailable, "bus-stream-closed")),
                Ok(Some(Err(_transport))) => continue,
                Ok(Some(Ok(signal))) => {
                    // JobRemoved carries (id, job path, unit name, result).
                    let Ok((_id, removed, _unit, result)) =
                        signal.body::<(u32, OwnedObjectPath, String, String)>()
                    else {
                        continue;
                    };
                    if &removed == job {
                        return Ok(JobResult::parse(&result));
                    }
                }
            }
        }
    }
}

fn remaining(deadline: Duration, started: Instant) -> Result<Duration> {
    deadline
        .checked_sub(started.elapsed())
        .filter(|remaining| !remaining.is_zero())
        .ok_or_else(|| Status::new(Code::DeadlineExceeded, "unit-job-wait"))
}

// Builders for the property list of a transient unit.

pub fn prop_string(name: &'static str, value: impl Into<String>) -> UnitProperty {
    (name, Value::from(value.into()))
}

pub fn prop_bool(name: &'static str, value: bool) -> UnitProperty {
    (name, Value::from(value))
}

pub fn prop_u64(name: &'static str, value: u64) -> UnitProperty {
    (name, Value::from(value))
}

/// String-array property, *e.g.* `Environment=`.
pub fn prop_string_array(name: &'static str, values: &[String]) -> UnitProperty {
    (name, Value::Array(Array::from(values.to_vec())))
}

/// Pid-array property, used to adopt processes into a scope via `PIDs=`.
pub fn prop_pids(name: &'static str, pids: &[u32]) -> UnitProperty {
    (name, Value::Array(Array::from(pids.to_vec())))
}

/// `ExecStart=` for a transient service: one entry of
/// (path, argv, ignore-failure).
pub fn prop_exec_start(argv: &[String]) -> UnitProperty {
    let entry = StructureBuilder::new()
        .append_field(Value::from(argv[0].clone()))
        .append_field(Value::Array(Array::from(argv.to_vec())))
        .append_field(Value::from(false))
        .build();
    let mut entries = Array::new(Signature::from_static_str_unchecked("(sasb)"));
    // The entry signature is statically correct for the array.
    entries.append(Value::Structure(entry)).unwrap();
    ("ExecStart", Value::Array(entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_results_parse() {
        assert_eq!(JobResult::parse("done"), JobResult::Done);
        assert_eq!(JobResult::parse("timeout"), JobResult::Timeout);
        assert_eq!(
            JobResult::parse("brand-new"),
            JobResult::Unknown(String::from("brand-new")),
        );
    }

    #[test]
    fn active_states_parse() {
        assert_eq!(ActiveState::parse("active"), ActiveState::Active);
        assert!(ActiveState::parse("inactive").is_terminal());
        assert!(ActiveState::parse("failed").is_terminal());
        assert!(!ActiveState::parse("deactivating").is_terminal());
    }

    #[test]
    fn exec_start_signature() {
        let argv = vec![String::from("/bin/sh"), String::from("-c"), String::from("true")];
        let (name, value) = prop_exec_start(&argv);

        assert_eq!(name, "ExecStart");
        assert_eq!(value.value_signature().as_str(), "a(sasb)");
    }
}
