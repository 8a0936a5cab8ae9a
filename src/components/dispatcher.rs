//! Command Dispatcher
//!
//! Sends textual commands over the active link and waits for the matching
//! response. Only one command is ever in flight on a link; concurrent callers,
//! through this dispatcher or any other on the same link, queue on the link's
//! fair turn lock and are served in arrival order.
use crate::api::controller::LinkOpener;
use crate::components::connection::{ConnectionManager, LinkContext};
use crate::core::error::{CommandError, ConnectionError};
use crate::model::obd::{Command, ConnectionState, Pid};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::Duration;

pub struct CommandDispatcher {
    link: LinkContext,
    default_timeout: Duration,
}

impl CommandDispatcher {
    /// Creates a dispatcher on the link owned by `connection`.
    ///
    /// `default_timeout` applies to commands without their own timeout.
    pub fn new<O: LinkOpener>(connection: &ConnectionManager<O>, default_timeout: Duration) -> Self {
        Self {
            link: connection.link(),
            default_timeout,
        }
    }

    /// Sends `command` and returns the response text.
    ///
    /// # Errors
    /// - `NotConnected` if the link is not connected, without touching the
    ///   result mapping.
    /// - `Timeout` if no response arrived in time. The outstanding slot is
    ///   cleared and the mapping stays unchanged.
    /// - `MalformedResponse` if the response does not match the command.
    /// - `Connection(Cancelled | LinkLost)` if the link went away meanwhile.
    pub async fn send(&self, command: &Command) -> Result<String, CommandError> {
        if self.link.state() != ConnectionState::Connected {
            return Err(CommandError::NotConnected);
        }
        let _turn = self.link.take_turn().await;
        let timeout = command.timeout().unwrap_or(self.default_timeout);
        let (token, mut completion) = self.link.begin(command).await?;
        debug!("Sent '{}'", command.request());

        match tokio::time::timeout(timeout, &mut completion).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectionError::Cancelled.into()),
            Err(_) => {
                if self.link.abandon(token).await {
                    let error = CommandError::Timeout(timeout.as_millis() as u64);
                    warn!("'{}' timed out", command.id());
                    self.link.publish_failure(command.id(), error.clone());
                    Err(error)
                } else {
                    // resolved while the timer fired
                    completion
                        .try_recv()
                        .unwrap_or_else(|_| Err(ConnectionError::Cancelled.into()))
                }
            }
        }
    }

    /// Queries a mode 01 parameter and decodes its value.
    pub async fn query(&self, pid: Pid) -> Result<f64, CommandError> {
        let response = self.send(&Command::pid(pid)).await?;
        pid.decode(&response)
    }

    /// Runs the adapter initialization sequence.
    pub async fn initialize_adapter(&self) -> Result<(), CommandError> {
        for command in Command::init_sequence() {
            self.send(&command).await?;
        }
        info!("Adapter initialized");
        Ok(())
    }

    /// Reads the `0100` support mask.
    pub async fn supported_pids(&self) -> Result<u32, CommandError> {
        Ok(self.query(Pid::SupportedPids).await? as u32)
    }

    /// Snapshot of the latest response per command id.
    pub async fn results(&self) -> HashMap<String, String> {
        self.link.results().await
    }

    /// Latest response for a single command id.
    pub async fn result(&self, id: &str) -> Option<String> {
        self.link.result(id).await
    }
}
