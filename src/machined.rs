//! Image import through `systemd-importd` and `systemd-machined`.
//!
//! The puller hands machined a flattened root-filesystem tarball; machined
//! unpacks it into its image pool and reports where the tree lives. Transfer
//! completion arrives as an importd `TransferRemoved` signal, subscribed
//! before the import call so completion cannot be missed.

use std::os::fd::AsRawFd;
use std::time::Duration;

use zbus::{MatchRule, MessageType};
use zvariant::{Fd, OwnedObjectPath};

use crate::bus::BusClient;
use crate::error::{Code, Result, Status};

const IMPORTD_DESTINATION: &str = "org.freedesktop.import1";
const IMPORTD_PATH: &str = "/org/freedesktop/import1";
const IMPORTD_MANAGER_INTERFACE: &str = "org.freedesktop.import1.Manager";

const MACHINED_DESTINATION: &str = "org.freedesktop.machine1";
const MACHINED_PATH: &str = "/org/freedesktop/machine1";
const MACHINED_MANAGER_INTERFACE: &str = "org.freedesktop.machine1.Manager";
const MACHINED_IMAGE_INTERFACE: &str = "org.freedesktop.machine1.Image";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Transfer result string importd reports on success.
const TRANSFER_DONE: &str = "done";

/// Client for importing and resolving machine images.
#[derive(Clone)]
pub struct MachinedImporter {
    bus: BusClient,
}

impl MachinedImporter {
    pub fn new(bus: BusClient) -> Self {
        MachinedImporter { bus }
    }

    /// Import `tar` as a read-only machine image named `machine_name`,
    /// waiting for the transfer to finish.
    pub async fn import_tar(
        &self,
        tar: &std::fs::File,
        machine_name: &str,
        deadline: Duration,
    ) -> Result<()> {
        let rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .interface(IMPORTD_MANAGER_INTERFACE)
            .map_err(|_| Status::new(Code::Internal, "bus-match-rule"))?
            .member("TransferRemoved")
            .map_err(|_| Status::new(Code::Internal, "bus-match-rule"))?
            .build();

        let result: String = self
            .bus
            .call_with_completion(
                rule,
                IMPORTD_DESTINATION,
                IMPORTD_PATH,
                IMPORTD_MANAGER_INTERFACE,
                "ImportTar",
                // (fd, local name, force, read-only)
                &(Fd::from(tar.as_raw_fd()), machine_name, true, true),
                |reply, signal| {
                    // The reply names the transfer; TransferRemoved carries
                    // (id, path, result).
                    let (_id, transfer_path) = reply.body::<(u32, OwnedObjectPath)>().ok()?;
                    let (_id, removed, result) =
                        signal.body::<(u32, OwnedObjectPath, String)>().ok()?;
                    (removed == transfer_path).then_some(result)
                },
                deadline,
            )
            .await?;

        if result == TRANSFER_DONE {
            Ok(())
        } else {
            Err(Status::new(
                Code::Internal,
                format!("machined-import-failed: {result}"),
            ))
        }
    }

    /// Filesystem path of an imported machine image's root directory.
    pub async fn image_path(&self, machine_name: &str) -> Result<String> {
        let reply = self
            .bus
            .call(
                MACHINED_DESTINATION,
                MACHINED_PATH,
                MACHINED_MANAGER_INTERFACE,
                "GetImage",
                &(machine_name,),
                crate::bus::DEFAULT_CALL_DEADLINE,
            )
            .await?;
        let image_path = reply
            .body::<OwnedObjectPath>()
            .map_err(|_| Status::new(Code::Internal, "bus-reply-decode"))?;

        let reply = self
            .bus
            .call(
                MACHINED_DESTINATION,
                image_path.as_str(),
                PROPERTIES_INTERFACE,
                "Get",
                &(MACHINED_IMAGE_INTERFACE, "Path"),
                crate::bus::DEFAULT_CALL_DEADLINE,
            )
            .await?;
        let value = reply
            .body::<zvariant::OwnedValue>()
            .map_err(|_| Status::new(Code::Internal, "bus-reply-decode"))?;
        String::try_from(value).map_err(|_| Status::new(Code::Internal, "bus-property-type"))
    }

    /// Drop a machine image. Missing images are not an error; removal is
    /// idempotent from the caller's perspective.
    pub async fn remove_image(&self, machine_name: &str) -> Result<()> {
        match self
            .bus
            .call(
                MACHINED_DESTINATION,
                MACHINED_PATH,
                MACHINED_MANAGER_INTERFACE,
                "RemoveImage",
                &(machine_name,),
                crate::bus::DEFAULT_CALL_DEADLINE,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(status) if status.code() == Code::NotFound => Ok(()),
            Err(status) => Err(status),
        }
    }
}
