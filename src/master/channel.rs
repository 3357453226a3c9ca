//! Channel task: owns the transport and routes frames to associations.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::codec::LinkFrame;
use crate::decode::DecodeLevel;
use crate::error::{Dnp3Error, Result};
use crate::master::association::{Association, Link};
use crate::master::config::{AssociationConfig, MasterChannelConfig};
use crate::master::handler::{AssociationHandlers, ChannelState, Listener};
use crate::master::task::AssociationMessage;
use crate::retry::Backoff;
use crate::transport::Transport;
use crate::types::LinkFunction;

/// Capacity of each handle to task message queue.
pub(crate) const MESSAGE_QUEUE_SIZE: usize = 16;

pub(crate) enum ChannelMessage {
    Enable,
    Disable,
    SetDecodeLevel(DecodeLevel),
    AddAssociation {
        address: u16,
        config: AssociationConfig,
        handlers: AssociationHandlers,
        reply: oneshot::Sender<Result<mpsc::Sender<AssociationMessage>>>,
    },
    RemoveAssociation(u16),
    Shutdown,
}

impl std::fmt::Debug for ChannelMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enable => f.write_str("Enable"),
            Self::Disable => f.write_str("Disable"),
            Self::SetDecodeLevel(level) => write!(f, "SetDecodeLevel({:?})", level),
            Self::AddAssociation { address, .. } => write!(f, "AddAssociation({})", address),
            Self::RemoveAssociation(address) => write!(f, "RemoveAssociation({})", address),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// What the channel does after handling a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// Enabled state changed, drop the connection
    Restart,
    Shutdown,
}

enum Event {
    Message(Option<ChannelMessage>),
    Outgoing(LinkFrame),
    Incoming(Result<LinkFrame>),
}

pub(crate) struct ChannelTask {
    config: MasterChannelConfig,
    transport: Box<dyn Transport>,
    rx: mpsc::Receiver<ChannelMessage>,
    out_tx: mpsc::UnboundedSender<LinkFrame>,
    out_rx: mpsc::UnboundedReceiver<LinkFrame>,
    associations: HashMap<u16, mpsc::UnboundedSender<LinkFrame>>,
    status: watch::Sender<ChannelState>,
    decode_level: watch::Sender<DecodeLevel>,
    listener: Box<dyn Listener<ChannelState>>,
    enabled: bool,
    backoff: Backoff,
}

impl ChannelTask {
    pub(crate) fn new(
        config: MasterChannelConfig,
        transport: Box<dyn Transport>,
        listener: Box<dyn Listener<ChannelState>>,
        rx: mpsc::Receiver<ChannelMessage>,
    ) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ChannelState::Disabled);
        let (decode_level, _) = watch::channel(config.decode_level);
        let backoff = config.connect_retry.backoff();
        Self {
            config,
            transport,
            rx,
            out_tx,
            out_rx,
            associations: HashMap::new(),
            status,
            decode_level,
            listener,
            enabled: false,
            backoff,
        }
    }

    pub(crate) async fn run(mut self) {
        self.listener.update(ChannelState::Disabled);
        loop {
            let flow = if self.enabled {
                self.run_enabled().await
            } else {
                self.set_state(ChannelState::Disabled);
                let message = self.rx.recv().await;
                self.on_message(message)
            };
            if flow == Flow::Shutdown {
                break;
            }
        }

        info!("Master channel shutting down");
        if let Err(e) = self.transport.close().await {
            debug!("Close failed: {}", e);
        }
        self.associations.clear();
        self.set_state(ChannelState::Shutdown);
    }

    fn set_state(&mut self, state: ChannelState) {
        let previous = self.status.send_replace(state);
        if previous != state {
            debug!("Channel state {} -> {}", previous, state);
            self.listener.update(state);
        }
    }

    /// One connect attempt plus the session that follows it.
    async fn run_enabled(&mut self) -> Flow {
        self.set_state(ChannelState::Connecting);
        let connected = tokio::select! {
            biased;
            message = self.rx.recv() => Err(message),
            result = self.transport.connect() => Ok(result),
        };
        let connected = match connected {
            Ok(result) => result,
            Err(message) => return self.on_message(message),
        };

        match connected {
            Ok(()) => {
                info!("Connected to {}", self.transport.peer());
                self.backoff.reset();
                self.set_state(ChannelState::Connected);
                let flow = self.run_session().await;
                if let Err(e) = self.transport.close().await {
                    debug!("Close failed: {}", e);
                }
                if flow != Flow::Continue {
                    return flow;
                }
            }
            Err(e) => warn!("Connect to {} failed: {}", self.transport.peer(), e),
        }

        // frames queued for the lost connection are stale
        while self.out_rx.try_recv().is_ok() {}
        self.wait_retry().await
    }

    async fn wait_retry(&mut self) -> Flow {
        let Some(delay) = self.backoff.on_failure() else {
            warn!("Connect attempts exhausted, disabling channel");
            self.enabled = false;
            return Flow::Restart;
        };
        self.set_state(ChannelState::WaitRetry);
        debug!("Reconnecting in {:?}", delay);

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            let message = tokio::select! {
                biased;
                message = self.rx.recv() => message,
                _ = &mut sleep => return Flow::Continue,
            };
            let flow = self.on_message(message);
            if flow != Flow::Continue {
                return flow;
            }
        }
    }

    async fn run_session(&mut self) -> Flow {
        loop {
            let event = tokio::select! {
                biased;
                message = self.rx.recv() => Event::Message(message),
                Some(frame) = self.out_rx.recv() => Event::Outgoing(frame),
                frame = self.transport.recv_frame() => Event::Incoming(frame),
            };

            match event {
                Event::Message(message) => {
                    let flow = self.on_message(message);
                    if flow != Flow::Continue {
                        return flow;
                    }
                }
                Event::Outgoing(frame) => {
                    if let Err(e) = self.transport.send_frame(frame).await {
                        warn!("Send failed: {}", e);
                        return Flow::Continue;
                    }
                }
                Event::Incoming(Ok(frame)) => {
                    if let Err(e) = self.route(frame).await {
                        warn!("Send failed: {}", e);
                        return Flow::Continue;
                    }
                }
                Event::Incoming(Err(e)) => {
                    warn!("Connection lost: {}", e);
                    return Flow::Continue;
                }
            }
        }
    }

    async fn route(&mut self, frame: LinkFrame) -> Result<()> {
        if frame.destination != self.config.master_address {
            debug!(
                "Ignoring frame for address {} from {}",
                frame.destination, frame.source
            );
            return Ok(());
        }
        if frame.function == LinkFunction::RequestLinkStatus {
            let reply = LinkFrame::link_status(frame.source, self.config.master_address);
            return self.transport.send_frame(reply).await;
        }

        let source = frame.source;
        match self.associations.get(&source) {
            Some(inbox) => {
                if inbox.send(frame).is_err() {
                    debug!("Association {} is gone", source);
                    self.associations.remove(&source);
                }
            }
            None => warn!("Frame from unknown outstation {}", source),
        }
        Ok(())
    }

    fn on_message(&mut self, message: Option<ChannelMessage>) -> Flow {
        let Some(message) = message else {
            return Flow::Shutdown;
        };
        match message {
            ChannelMessage::Enable => {
                if !self.enabled {
                    info!("Master channel enabled");
                    self.enabled = true;
                    self.backoff.reset();
                    return Flow::Restart;
                }
            }
            ChannelMessage::Disable => {
                if self.enabled {
                    info!("Master channel disabled");
                    self.enabled = false;
                    return Flow::Restart;
                }
            }
            ChannelMessage::SetDecodeLevel(level) => {
                self.decode_level.send_replace(level);
            }
            ChannelMessage::AddAssociation {
                address,
                config,
                handlers,
                reply,
            } => {
                let _ = reply.send(self.add_association(address, config, handlers));
            }
            ChannelMessage::RemoveAssociation(address) => {
                if self.associations.remove(&address).is_some() {
                    info!("Association {} removed", address);
                }
            }
            ChannelMessage::Shutdown => return Flow::Shutdown,
        }
        Flow::Continue
    }

    fn add_association(
        &mut self,
        address: u16,
        config: AssociationConfig,
        handlers: AssociationHandlers,
    ) -> Result<mpsc::Sender<AssociationMessage>> {
        config.validate()?;
        if address == self.config.master_address {
            return Err(Dnp3Error::invalid_config(
                "association address equals the master address",
            ));
        }
        if self
            .associations
            .get(&address)
            .is_some_and(|inbox| !inbox.is_closed())
        {
            return Err(Dnp3Error::DuplicateAssociation(address));
        }

        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (tx, messages) = mpsc::channel(MESSAGE_QUEUE_SIZE);
        let link = Link {
            tx: self.out_tx.clone(),
            inbox,
            status: self.status.subscribe(),
            decode_level: self.decode_level.subscribe(),
        };
        let association = Association::new(
            address,
            self.config.master_address,
            config,
            handlers.read,
            handlers.listener,
            handlers.clock,
            link,
            messages,
        );
        self.associations.insert(address, inbox_tx);
        tokio::spawn(association.run());
        info!("Association {} added", address);
        Ok(tx)
    }
}
