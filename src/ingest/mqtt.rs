//! MQTT subscription ingestor.
//!
//! The ingestor is a publish/subscribe client governed by an explicit,
//! strictly ordered state machine: `Init -> Setup -> Running -> Stopped`.
//! Every lifecycle method first asserts the ingestor sits exactly one state
//! below its target and fails closed: a precondition violation returns an
//! error and performs no action at all.
//!
//! Orthogonal to the lifecycle, [`LinkStatus`] tracks whether the network
//! link is currently connected. Connect/disconnect acknowledgements flip it,
//! and `run()` refuses to start while the link is down.
//!
//! The ingestor owns its collaborators by composition: a rumqttc client plus
//! event loop for the network role, and an [`EventHooks`] dispatcher for the
//! callback role. Hooks follow a single-threaded-callback / separate-consumer
//! split: `on_message` enqueues onto an in-process delivery queue and
//! returns, and only the consume loop inside `run()` talks to the broker.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use rumqttc::{AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing,
    Packet, Publish, QoS, SubAck, SubscribeReasonCode};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::broker::BrokerHandle;
use crate::buffer::BufferCategory;
use crate::config::MqttSettings;
use crate::envelope::Envelope;
use crate::error::{AppResult, HubError};
use crate::shutdown::Shutdown;

/// How long setup waits for the broker's ConnAck.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// How long setup waits for each SubAck.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
/// How long stop waits for the disconnect acknowledgement.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Ordered lifecycle phase of the ingestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Init = 1,
    Setup = 2,
    Running = 3,
    Stopped = 4,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Init => "INIT",
            ConnectionState::Setup => "SETUP",
            ConnectionState::Running => "RUNNING",
            ConnectionState::Stopped => "STOPPED",
        }
    }

    /// The only state legally reachable from this one.
    pub fn next(&self) -> Option<ConnectionState> {
        match self {
            ConnectionState::Init => Some(ConnectionState::Setup),
            ConnectionState::Setup => Some(ConnectionState::Running),
            ConnectionState::Running => Some(ConnectionState::Stopped),
            ConnectionState::Stopped => None,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether the network link is currently connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Alive,
    Dead,
}

/// One acknowledged topic subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic_pattern: String,
}

/// Callback dispatcher for MQTT events.
///
/// `on_connect` / `on_disconnect` update the link status. `on_message` is the
/// single ingestion point: it wraps the publish in an [`Envelope`] and
/// enqueues it on the delivery queue without blocking. The remaining hooks
/// are observational only and never touch the lifecycle state.
#[derive(Clone)]
struct EventHooks {
    client_id: String,
    link: Arc<watch::Sender<LinkStatus>>,
    delivery: mpsc::UnboundedSender<Envelope>,
    verbose: bool,
}

impl EventHooks {
    fn dispatch(&self, event: &Event) {
        if self.verbose {
            self.on_event_trace(event);
        }
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => self.on_connect(ack),
            Event::Incoming(Packet::Publish(publish)) => self.on_message(publish),
            Event::Incoming(Packet::PubAck(ack)) => self.on_publish(ack.pkid),
            Event::Incoming(Packet::SubAck(ack)) => self.on_subscribe(ack.pkid),
            Event::Incoming(Packet::UnsubAck(ack)) => self.on_unsubscribe(ack.pkid),
            Event::Incoming(Packet::Disconnect) | Event::Outgoing(Outgoing::Disconnect) => {
                self.on_disconnect()
            }
            _ => {}
        }
    }

    fn on_connect(&self, ack: &ConnAck) {
        if ack.code == ConnectReturnCode::Success {
            info!("MQTT link up (session_present={})", ack.session_present);
            let _ = self.link.send(LinkStatus::Alive);
        } else {
            warn!("MQTT broker refused connection: {:?}", ack.code);
            let _ = self.link.send(LinkStatus::Dead);
        }
    }

    fn on_disconnect(&self) {
        info!("MQTT link down");
        let _ = self.link.send(LinkStatus::Dead);
    }

    /// Enqueue-and-return: no broker I/O happens on the callback path.
    fn on_message(&self, publish: &Publish) {
        debug!(
            "Message on '{}' ({} bytes)",
            publish.topic,
            publish.payload.len()
        );
        let envelope = Envelope::new(
            BufferCategory::Pubsub,
            self.client_id.clone(),
            publish.payload.to_vec(),
        );
        let _ = self.delivery.send(envelope);
    }

    fn on_publish(&self, pkid: u16) {
        debug!("Publish acknowledged (pkid {pkid})");
    }

    fn on_subscribe(&self, pkid: u16) {
        debug!("Subscribe acknowledged (pkid {pkid})");
    }

    fn on_unsubscribe(&self, pkid: u16) {
        debug!("Unsubscribe acknowledged (pkid {pkid})");
    }

    /// Diagnostic hook, installed only in verbose mode.
    fn on_event_trace(&self, event: &Event) {
        trace!("MQTT event: {event:?}");
    }
}

/// Publish/subscribe ingestion client feeding the MqttRx buffer.
pub struct SubscriptionIngestor {
    settings: MqttSettings,
    state: ConnectionState,
    subscriptions: Vec<Subscription>,
    hooks: EventHooks,
    link_rx: watch::Receiver<LinkStatus>,
    delivery_rx: mpsc::UnboundedReceiver<Envelope>,
    client: Option<AsyncClient>,
    event_loop: Option<EventLoop>,
    network_task: Option<JoinHandle<()>>,
    shutdown: Shutdown,
}

impl SubscriptionIngestor {
    pub fn new(settings: MqttSettings, verbose: bool) -> Self {
        let (link_tx, link_rx) = watch::channel(LinkStatus::Dead);
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let hooks = EventHooks {
            client_id: settings.client_id.clone(),
            link: Arc::new(link_tx),
            delivery: delivery_tx,
            verbose,
        };
        Self {
            settings,
            state: ConnectionState::Init,
            subscriptions: Vec::new(),
            hooks,
            link_rx,
            delivery_rx,
            client: None,
            event_loop: None,
            network_task: None,
            shutdown: Shutdown::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn link_status(&self) -> LinkStatus {
        *self.link_rx.borrow()
    }

    /// Topics acknowledged so far, in subscription order. Never mutated after
    /// setup completes.
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Trigger used to ask `run()`'s consume loop to exit; clone it before
    /// calling `run`.
    pub fn shutdown_signal(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Verifies the ingestor sits exactly one state below `target`.
    fn ensure_transition(&self, target: ConnectionState) -> AppResult<()> {
        if self.state.next() == Some(target) {
            Ok(())
        } else {
            Err(HubError::InvalidTransition {
                from: self.state.as_str(),
                to: target.as_str(),
            })
        }
    }

    /// A broker that refuses a subscription answers with the failure reason
    /// code in place of a granted QoS.
    fn check_suback(topic: &str, ack: &SubAck) -> AppResult<()> {
        let refused = ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure));
        if refused {
            return Err(HubError::Protocol(format!(
                "subscription to '{topic}' refused by broker"
            )));
        }
        Ok(())
    }

    /// Connects to the MQTT broker and subscribes to the configured topics.
    ///
    /// Requires state `Init`. On any failure the state remains `Init` and no
    /// subscription is recorded; on success the state becomes `Setup`.
    pub async fn setup(&mut self) -> AppResult<()> {
        self.ensure_transition(ConnectionState::Setup)?;

        let mut options = MqttOptions::new(
            self.settings.client_id.clone(),
            self.settings.host.clone(),
            self.settings.port,
        );
        options.set_keep_alive(Duration::from_secs(self.settings.keepalive_secs));

        info!(
            "Connecting to MQTT broker {}:{}",
            self.settings.host, self.settings.port
        );
        let (client, mut event_loop) = AsyncClient::new(options, 64);

        // Drive the event loop until the broker acknowledges the connection.
        loop {
            let event = timeout(CONNECT_TIMEOUT, event_loop.poll())
                .await
                .map_err(|_| HubError::LinkDown)??;
            self.hooks.dispatch(&event);
            if let Event::Incoming(Packet::ConnAck(ack)) = &event {
                if ack.code == ConnectReturnCode::Success {
                    break;
                }
                return Err(HubError::Protocol(format!(
                    "MQTT connect refused: {:?}",
                    ack.code
                )));
            }
        }

        // Subscribe in configured order, recording each topic only after a
        // granting acknowledgement. Subscribes are the only id-carrying
        // packets sent during setup, so the nth SubAck carries packet id n.
        let mut acknowledged = Vec::with_capacity(self.settings.topics.len());
        for (index, topic) in self.settings.topics.iter().enumerate() {
            let expected_pkid = (index + 1) as u16;
            client.subscribe(topic.clone(), QoS::AtLeastOnce).await?;
            loop {
                let event = timeout(ACK_TIMEOUT, event_loop.poll())
                    .await
                    .map_err(|_| HubError::LinkDown)??;
                self.hooks.dispatch(&event);
                if let Event::Incoming(Packet::SubAck(ack)) = &event {
                    if ack.pkid != expected_pkid {
                        continue;
                    }
                    Self::check_suback(topic, ack)?;
                    break;
                }
            }
            info!("Subscribed to '{}'", topic);
            acknowledged.push(Subscription {
                topic_pattern: topic.clone(),
            });
        }

        self.subscriptions = acknowledged;
        self.client = Some(client);
        self.event_loop = Some(event_loop);
        self.state = ConnectionState::Setup;
        Ok(())
    }

    /// Starts the network loop and consumes inbound messages into the MqttRx
    /// buffer via `rx_handle`.
    ///
    /// Requires state `Setup` and a live link. Returns when the link dies or
    /// the shutdown signal fires; cancellation is cooperative, checked once
    /// per loop iteration.
    pub async fn run(&mut self, mut rx_handle: BrokerHandle) -> AppResult<()> {
        self.ensure_transition(ConnectionState::Running)?;
        if self.link_status() != LinkStatus::Alive {
            return Err(HubError::LinkDown);
        }
        let mut event_loop = self.event_loop.take().ok_or(HubError::LinkDown)?;
        self.state = ConnectionState::Running;

        // Network loop: polls the protocol engine and dispatches every event
        // to the hooks. It ends on its own when the link closes, which is
        // also how a disconnect acknowledgement reaches the hooks.
        let hooks = self.hooks.clone();
        self.network_task = Some(tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(event) => hooks.dispatch(&event),
                    Err(e) => {
                        debug!("MQTT network loop closed: {e}");
                        hooks.on_disconnect();
                        break;
                    }
                }
            }
        }));

        info!("Ingestor running; forwarding into {}", rx_handle.name());
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut link_rx = self.link_rx.clone();
        loop {
            tokio::select! {
                _ = crate::shutdown::triggered(&mut shutdown_rx) => {
                    info!("Ingestor consume loop stopping on request");
                    break;
                }
                _ = link_rx.wait_for(|s| *s == LinkStatus::Dead) => {
                    warn!("Ingestor consume loop stopping: link dead");
                    break;
                }
                delivered = self.delivery_rx.recv() => match delivered {
                    Some(envelope) => {
                        if let Err(e) = rx_handle.push(envelope).await {
                            error!("Failed to forward message to broker: {e}");
                        }
                    }
                    None => break,
                },
            }
        }
        Ok(())
    }

    /// Disconnects from the MQTT broker.
    ///
    /// Requires state `Running`. The transition to `Stopped` happens only
    /// once the disconnect acknowledgement confirms the link is dead;
    /// otherwise the call fails, the state is unchanged, and teardown must be
    /// retried.
    pub async fn stop(&mut self) -> AppResult<()> {
        self.ensure_transition(ConnectionState::Stopped)?;

        if self.link_status() == LinkStatus::Alive {
            if let Some(client) = &self.client {
                client.disconnect().await?;
            }
        }

        let confirmed = matches!(
            timeout(
                STOP_TIMEOUT,
                self.link_rx.wait_for(|s| *s == LinkStatus::Dead),
            )
            .await,
            Ok(Ok(_))
        );
        if !confirmed {
            return Err(HubError::DisconnectUnconfirmed);
        }

        if let Some(task) = self.network_task.take() {
            let _ = task.await;
        }
        self.state = ConnectionState::Stopped;
        info!("Ingestor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> MqttSettings {
        MqttSettings {
            host: "localhost".to_string(),
            port: 1883,
            keepalive_secs: 30,
            client_id: "sensorhub-test".to_string(),
            topics: vec![
                "sensor/+/data/temp".to_string(),
                "sensor/+/data/acc".to_string(),
                "sensor/+/status".to_string(),
            ],
        }
    }

    #[test]
    fn state_order_is_linear() {
        assert_eq!(ConnectionState::Init.next(), Some(ConnectionState::Setup));
        assert_eq!(ConnectionState::Setup.next(), Some(ConnectionState::Running));
        assert_eq!(
            ConnectionState::Running.next(),
            Some(ConnectionState::Stopped)
        );
        assert_eq!(ConnectionState::Stopped.next(), None);
        assert!(ConnectionState::Init < ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn fresh_ingestor_rejects_stop() {
        let mut ingestor = SubscriptionIngestor::new(test_settings(), false);
        let result = ingestor.stop().await;
        assert!(matches!(
            result,
            Err(HubError::InvalidTransition {
                from: "INIT",
                to: "STOPPED"
            })
        ));
        assert_eq!(ingestor.state(), ConnectionState::Init);
    }

    #[test]
    fn refused_subscription_is_an_error() {
        let refused = SubAck::new(1, vec![SubscribeReasonCode::Failure]);
        let result = SubscriptionIngestor::check_suback("sensor/+/data/temp", &refused);
        assert!(matches!(result, Err(HubError::Protocol(_))));

        let granted = SubAck::new(2, vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)]);
        assert!(SubscriptionIngestor::check_suback("sensor/+/status", &granted).is_ok());

        // A batched ack is refused as soon as any one grant is missing.
        let mixed = SubAck::new(
            3,
            vec![
                SubscribeReasonCode::Success(QoS::AtLeastOnce),
                SubscribeReasonCode::Failure,
            ],
        );
        assert!(SubscriptionIngestor::check_suback("sensor/+/data/acc", &mixed).is_err());
    }

    #[tokio::test]
    async fn setup_twice_is_rejected_and_state_unchanged() {
        let mut ingestor = SubscriptionIngestor::new(test_settings(), false);
        // Force the Setup state as if a first setup() had succeeded.
        ingestor.state = ConnectionState::Setup;
        let result = ingestor.setup().await;
        assert!(matches!(result, Err(HubError::InvalidTransition { .. })));
        assert_eq!(ingestor.state(), ConnectionState::Setup);
    }

    #[tokio::test]
    async fn stop_twice_needs_intervening_setup() {
        let mut ingestor = SubscriptionIngestor::new(test_settings(), false);
        ingestor.state = ConnectionState::Stopped;
        let result = ingestor.stop().await;
        assert!(matches!(result, Err(HubError::InvalidTransition { .. })));
        assert_eq!(ingestor.state(), ConnectionState::Stopped);
    }

    #[test]
    fn on_message_enqueues_without_blocking() {
        let mut ingestor = SubscriptionIngestor::new(test_settings(), false);
        let publish = Publish::new("sensor/1/data/temp", QoS::AtLeastOnce, &b"21.5"[..]);
        ingestor.hooks.on_message(&publish);
        ingestor.hooks.on_message(&publish);

        let first = ingestor.delivery_rx.try_recv().unwrap();
        assert_eq!(first.category, BufferCategory::Pubsub);
        assert_eq!(first.origin, "sensorhub-test");
        assert_eq!(first.payload, b"21.5");
        assert!(ingestor.delivery_rx.try_recv().is_ok());
    }

    #[test]
    fn observational_hooks_do_not_touch_link_status() {
        let ingestor = SubscriptionIngestor::new(test_settings(), true);
        ingestor.hooks.on_publish(1);
        ingestor.hooks.on_subscribe(2);
        ingestor.hooks.on_unsubscribe(3);
        assert_eq!(ingestor.link_status(), LinkStatus::Dead);

        let ack = ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        };
        ingestor.hooks.on_connect(&ack);
        assert_eq!(ingestor.link_status(), LinkStatus::Alive);
        ingestor.hooks.on_disconnect();
        assert_eq!(ingestor.link_status(), LinkStatus::Dead);
    }
}
