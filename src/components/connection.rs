//! Connection Manager
//!
//! Owns the single adapter link. All connection and command state (link state
//! machine, writer, outstanding command, result mapping) lives in one
//! mutex-guarded block, shared with the dispatcher and the listener task that
//! consumes the inbound byte stream.
use crate::api::controller::{LinkOpener, LinkWriter};
use crate::api::model::ConnectionModelApi;
use crate::core::error::{CommandError, ConnectionError};
use crate::core::events::AppEvent;
use crate::model::obd::{Command, ConnectionState, DeviceDescriptor, ResponseFramer};
use futures::stream::{BoxStream, StreamExt};
use log::{debug, info, trace, warn};
use rust_fsm::*;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast::Sender, oneshot, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

state_machine! {
    link_fsm(Disconnected)

    Disconnected => {
        Connect => Connecting,
        Disconnect => Disconnected
    },
    Connecting => {
        Established => Connected,
        Fail => Failed,
        Disconnect => Disconnected
    },
    Connected => {
        Disconnect => Disconnected,
        LinkLost => Failed
    },
    Failed => {
        Connect => Connecting,
        Disconnect => Disconnected
    }
}

fn public_state(state: &link_fsm::State) -> ConnectionState {
    match state {
        link_fsm::State::Disconnected => ConnectionState::Disconnected,
        link_fsm::State::Connecting => ConnectionState::Connecting,
        link_fsm::State::Connected => ConnectionState::Connected,
        link_fsm::State::Failed => ConnectionState::Failed,
    }
}

pub(crate) type Completion = oneshot::Sender<Result<String, CommandError>>;

/// The command currently waiting for its response.
pub(crate) struct Outstanding {
    token: u64,
    command: Command,
    completion: Completion,
}

/// State guarded by the link mutex.
pub(crate) struct LinkShared {
    machine: link_fsm::StateMachine,
    device: Option<DeviceDescriptor>,
    writer: Option<Box<dyn LinkWriter>>,
    listener: Option<JoinHandle<()>>,
    /// Bumped on every connect and disconnect so stale tasks can detect that
    /// the link they belong to is gone.
    generation: u64,
    next_token: u64,
    outstanding: Option<Outstanding>,
    results: HashMap<String, String>,
}

impl LinkShared {
    fn new() -> Self {
        Self {
            machine: link_fsm::StateMachine::new(),
            device: None,
            writer: None,
            listener: None,
            generation: 0,
            next_token: 0,
            outstanding: None,
            results: HashMap::new(),
        }
    }

    fn state(&self) -> ConnectionState {
        public_state(self.machine.state())
    }
}

/// Handle to the shared link state, cloned into the dispatcher and the
/// listener task.
#[derive(Clone)]
pub(crate) struct LinkContext {
    shared: Arc<Mutex<LinkShared>>,
    /// Held for a whole command exchange, so only one command is in flight.
    turn: Arc<Mutex<()>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    event_bus: Sender<AppEvent>,
}

impl LinkContext {
    fn new(event_bus: Sender<AppEvent>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Mutex::new(LinkShared::new())),
            turn: Arc::new(Mutex::new(())),
            state_tx: Arc::new(state_tx),
            event_bus,
        }
    }

    /// Applies a transition and publishes the new state while the lock is held,
    /// so observers see transitions in order and never a half-applied one.
    fn apply(
        &self,
        shared: &mut LinkShared,
        input: link_fsm::Input,
    ) -> Result<ConnectionState, ConnectionError> {
        if shared.machine.consume(&input).is_err() {
            return Err(ConnectionError::InvalidTransition(shared.state()));
        }
        let state = shared.state();
        self.state_tx.send_replace(state);
        let _ = self.event_bus.send(AppEvent::ConnectionChanged {
            state,
            device: shared.device.clone(),
        });
        Ok(state)
    }

    fn fail_outstanding(&self, shared: &mut LinkShared, error: CommandError) {
        if let Some(outstanding) = shared.outstanding.take() {
            debug!("Failing '{}': {}", outstanding.command.id(), error);
            self.publish_failure(outstanding.command.id(), error.clone());
            let _ = outstanding.completion.send(Err(error));
        }
    }

    pub(crate) fn publish_failure(&self, id: &str, error: CommandError) {
        let _ = self.event_bus.send(AppEvent::CommandFailed {
            id: id.to_owned(),
            error,
        });
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Waits until no other exchange uses the link. The tokio mutex is fair,
    /// so callers are served in arrival order.
    pub(crate) async fn take_turn(&self) -> OwnedMutexGuard<()> {
        self.turn.clone().lock_owned().await
    }

    /// Writes `command` and occupies the outstanding slot with it.
    ///
    /// Returns the token identifying this attempt and the receiver that
    /// resolves once the listener matched a response. Fails with `Busy` while
    /// another command still holds the slot; callers hold `take_turn` to
    /// avoid that.
    pub(crate) async fn begin(
        &self,
        command: &Command,
    ) -> Result<(u64, oneshot::Receiver<Result<String, CommandError>>), CommandError> {
        let mut shared = self.shared.lock().await;
        if shared.state() != ConnectionState::Connected {
            return Err(CommandError::NotConnected);
        }
        if let Some(busy) = &shared.outstanding {
            return Err(CommandError::Busy(busy.command.id().to_owned()));
        }
        let writer = shared.writer.as_mut().ok_or(CommandError::NotConnected)?;
        if let Err(e) = writer.write_all(&command.to_bytes()).await {
            warn!("Writing '{}' failed: {}", command.request(), e);
            return Err(ConnectionError::LinkLost.into());
        }
        shared.next_token += 1;
        let token = shared.next_token;
        let (completion, receiver) = oneshot::channel();
        shared.outstanding = Some(Outstanding {
            token,
            command: command.clone(),
            completion,
        });
        Ok((token, receiver))
    }

    /// Clears the outstanding slot if it still holds the attempt `token`.
    pub(crate) async fn abandon(&self, token: u64) -> bool {
        let mut shared = self.shared.lock().await;
        match &shared.outstanding {
            Some(outstanding) if outstanding.token == token => {
                shared.outstanding = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn results(&self) -> HashMap<String, String> {
        self.shared.lock().await.results.clone()
    }

    pub(crate) async fn result(&self, id: &str) -> Option<String> {
        self.shared.lock().await.results.get(id).cloned()
    }

    /// Resolves the outstanding command with a framed response.
    fn resolve(&self, shared: &mut LinkShared, frame: String) {
        if frame.is_empty() {
            trace!("Ignoring empty response");
            return;
        }
        let Some(outstanding) = shared.outstanding.take() else {
            warn!("Dropping unsolicited response '{}'", frame);
            return;
        };
        let response = outstanding.command.strip_echo(&frame);
        if response.is_empty() {
            // only the echo arrived, keep waiting
            shared.outstanding = Some(outstanding);
            return;
        }
        let id = outstanding.command.id().to_owned();
        if outstanding.command.matcher().matches(&response) {
            debug!("'{}' -> '{}'", id, response);
            shared.results.insert(id.clone(), response.clone());
            let _ = self.event_bus.send(AppEvent::CommandCompleted {
                id,
                response: response.clone(),
            });
            let _ = outstanding.completion.send(Ok(response));
        } else {
            warn!("Unexpected response to '{}': '{}'", id, response);
            let error = CommandError::MalformedResponse(response);
            self.publish_failure(&id, error.clone());
            let _ = outstanding.completion.send(Err(error));
        }
    }

    /// Handles the end of the inbound stream of link `generation`.
    fn lose(&self, shared: &mut LinkShared, generation: u64) {
        if shared.generation != generation || shared.state() != ConnectionState::Connected {
            return;
        }
        warn!("Link to the adapter was lost");
        shared.writer = None;
        shared.listener = None;
        self.fail_outstanding(shared, ConnectionError::LinkLost.into());
        let _ = self.apply(shared, link_fsm::Input::LinkLost);
    }
}

/// Consumes the inbound stream of one link until it ends.
async fn listen(
    link: LinkContext,
    mut inbound: BoxStream<'static, io::Result<Vec<u8>>>,
    generation: u64,
) {
    let mut framer = ResponseFramer::new();
    while let Some(chunk) = inbound.next().await {
        match chunk {
            Ok(bytes) => {
                trace!("Received {:?}", String::from_utf8_lossy(&bytes));
                for frame in framer.push(&bytes) {
                    let mut shared = link.shared.lock().await;
                    if shared.generation != generation {
                        return;
                    }
                    link.resolve(&mut shared, frame);
                }
            }
            Err(e) => {
                warn!("Reading from the adapter failed: {}", e);
                break;
            }
        }
    }
    let mut shared = link.shared.lock().await;
    link.lose(&mut shared, generation);
}

/// Manages the lifecycle of the adapter link.
///
/// # Type Parameters
/// - `O`: transport used to open the link
pub struct ConnectionManager<O: LinkOpener> {
    opener: O,
    link: LinkContext,
    connect_timeout: Duration,
}

impl<O: LinkOpener> ConnectionManager<O> {
    pub fn new(opener: O, event_bus: Sender<AppEvent>, connect_timeout: Duration) -> Self {
        Self {
            opener,
            link: LinkContext::new(event_bus),
            connect_timeout,
        }
    }

    pub(crate) fn link(&self) -> LinkContext {
        self.link.clone()
    }

    /// Device of the current or last connection attempt.
    pub async fn device(&self) -> Option<DeviceDescriptor> {
        self.link.shared.lock().await.device.clone()
    }

    /// Opens a link to `device`.
    ///
    /// Allowed from Disconnected and Failed. Fails with `AlreadyConnected`
    /// otherwise and leaves the state untouched.
    pub async fn connect(&self, device: DeviceDescriptor) -> Result<(), ConnectionError> {
        let generation = {
            let mut shared = self.link.shared.lock().await;
            if !matches!(
                shared.state(),
                ConnectionState::Disconnected | ConnectionState::Failed
            ) {
                return Err(ConnectionError::AlreadyConnected);
            }
            shared.generation += 1;
            shared.device = Some(device.clone());
            self.link.apply(&mut shared, link_fsm::Input::Connect)?;
            shared.generation
        };

        info!("Connecting to {}", device);
        let opened = match tokio::time::timeout(self.connect_timeout, self.opener.open(&device))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        };

        let mut shared = self.link.shared.lock().await;
        if shared.generation != generation || shared.state() != ConnectionState::Connecting {
            info!("Connection attempt to {} was cancelled", device);
            return Err(ConnectionError::Cancelled);
        }
        match opened {
            Ok(link) => {
                shared.writer = Some(link.outbound);
                shared.listener = Some(tokio::spawn(listen(
                    self.link.clone(),
                    link.inbound,
                    generation,
                )));
                self.link.apply(&mut shared, link_fsm::Input::Established)?;
                info!("Connected to {}", device);
                Ok(())
            }
            Err(e) => {
                warn!("Connecting to {} failed: {}", device, e);
                self.link.apply(&mut shared, link_fsm::Input::Fail)?;
                Err(e)
            }
        }
    }

    /// Closes the link from any state. A command still waiting for its
    /// response fails with `Cancelled`.
    pub async fn disconnect(&self) {
        let mut shared = self.link.shared.lock().await;
        shared.generation += 1;
        if let Some(listener) = shared.listener.take() {
            listener.abort();
        }
        if let Some(mut writer) = shared.writer.take() {
            if let Err(e) = writer.close().await {
                debug!("Closing the adapter link failed: {}", e);
            }
        }
        self.link
            .fail_outstanding(&mut shared, ConnectionError::Cancelled.into());
        if self
            .link
            .apply(&mut shared, link_fsm::Input::Disconnect)
            .is_ok()
        {
            info!("Disconnected");
        }
    }
}

impl<O: LinkOpener> ConnectionModelApi for ConnectionManager<O> {
    fn get_state(&self) -> ConnectionState {
        self.link.state()
    }

    fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.link.subscribe()
    }
}
