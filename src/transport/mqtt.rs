//! MQTT listener
//!
//! Subscribes to `{base}/execute` and `{base}/commands` and publishes every
//! reply to `{base}/response`. MQTT has no per-request reply channel, so the
//! caller's correlation id travels in the payload and is echoed in every
//! reply, error replies included. Each request runs on its own task and
//! replies go out in completion order.

use super::traits::{Listener, ListenerControl};
use crate::command::{CommandService, ExecuteRequest, ExecutionResult};
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::security::ClientIdentity;
use async_trait::async_trait;
use bytes::Bytes;
use deskctl_shared::codec::{self, CommandEntry, ResponseMessage, ResultPayload};
use deskctl_shared::limits::MAX_MQTT_PAYLOAD;
use deskctl_shared::state_machine::ListenerState;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const NAME: &str = "mqtt";

/// Identity bucket for callers that do not send a `clientId`
const ANONYMOUS: &str = "anonymous";

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub base_topic: String,
}

impl From<&AgentConfig> for MqttSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            client_id: config.mqtt_client_id.clone(),
            username: config.mqtt_username.clone(),
            password: config.mqtt_password.clone(),
            base_topic: config.mqtt_base_topic.clone(),
        }
    }
}

impl MqttSettings {
    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_max_packet_size(MAX_MQTT_PAYLOAD + 1024, MAX_MQTT_PAYLOAD + 1024);
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.clone().unwrap_or_default());
        }
        options
    }
}

/// Topic names derived from the base topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub execute: String,
    pub commands: String,
    pub response: String,
}

impl Topics {
    pub fn new(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            execute: format!("{base}/execute"),
            commands: format!("{base}/commands"),
            response: format!("{base}/response"),
        }
    }
}

fn result_payload(result: ExecutionResult) -> ResultPayload {
    ResultPayload {
        success: result.success,
        output: result.output,
        error: result.error,
        exit_code: result.exit_code,
        duration_ms: result.duration.as_millis() as u64,
        executed_at: result.executed_at,
        failure: result.failure.map(|f| f.as_str().to_string()),
    }
}

/// Produce the reply for one inbound publish; `None` for foreign topics
pub async fn handle_message(
    service: &CommandService,
    topics: &Topics,
    topic: &str,
    payload: &[u8],
) -> Option<ResponseMessage> {
    if topic == topics.execute {
        Some(handle_execute(service, payload).await)
    } else if topic == topics.commands {
        Some(handle_commands(service, payload).await)
    } else {
        None
    }
}

async fn handle_execute(service: &CommandService, payload: &[u8]) -> ResponseMessage {
    let message = match codec::decode_execute(payload) {
        Ok(message) => message,
        Err(e) => {
            return ResponseMessage::error(
                codec::recover_correlation_id(payload),
                e.code(),
                e.to_string(),
            )
        }
    };

    let source = message
        .client_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .unwrap_or(ANONYMOUS);
    let client = ClientIdentity::derive(NAME, source, "");
    debug!(command = %message.command_id, correlation = %message.correlation_id, client = %client, "MQTT execute");

    let request = ExecuteRequest::new(message.command_id, client)
        .with_pin(message.pin)
        .with_timeout(message.timeout.map(Duration::from_millis));

    match service.execute(request).await {
        Ok(result) => ResponseMessage::execute_result(message.correlation_id, result_payload(result)),
        Err(e) => ResponseMessage::error(message.correlation_id, e.code(), e.to_string()),
    }
}

async fn handle_commands(service: &CommandService, payload: &[u8]) -> ResponseMessage {
    let message = match codec::decode_commands(payload) {
        Ok(message) => message,
        Err(e) => {
            return ResponseMessage::error(
                codec::recover_correlation_id(payload),
                e.code(),
                e.to_string(),
            )
        }
    };

    let commands = service
        .list()
        .await
        .into_iter()
        .map(|c| CommandEntry {
            id: c.id,
            name: c.name,
            description: c.description,
            category: c.category,
        })
        .collect();
    ResponseMessage::commands(message.correlation_id, commands)
}

/// Encode a reply, degrading to an error reply if it does not fit
fn encode_reply(reply: &ResponseMessage) -> Option<Bytes> {
    match codec::encode(reply) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(correlation = %reply.correlation_id, "reply not encodable: {}", e);
            let fallback = ResponseMessage::error(reply.correlation_id.clone(), e.code(), e.to_string());
            codec::encode(&fallback).ok()
        }
    }
}

/// MQTT front-end of the command service
pub struct MqttListener {
    settings: MqttSettings,
    topics: Topics,
    service: Arc<CommandService>,
    control: ListenerControl,
}

impl MqttListener {
    pub fn new(settings: MqttSettings, service: Arc<CommandService>) -> Self {
        let control = ListenerControl::new(NAME, service.listeners().clone());
        let topics = Topics::new(&settings.base_topic);
        Self {
            settings,
            topics,
            service,
            control,
        }
    }

    fn dispatch(&self, client: &AsyncClient, topic: String, payload: Bytes) {
        let service = self.service.clone();
        let topics = self.topics.clone();
        let client = client.clone();

        tokio::spawn(async move {
            let Some(reply) = handle_message(&service, &topics, &topic, &payload).await else {
                debug!(topic = %topic, "ignoring publish on unexpected topic");
                return;
            };
            let Some(bytes) = encode_reply(&reply) else {
                return;
            };
            if let Err(e) = client
                .publish(topics.response.as_str(), QoS::AtLeastOnce, false, bytes.to_vec())
                .await
            {
                warn!(correlation = %reply.correlation_id, "failed to publish reply: {}", e);
            }
        });
    }

    async fn serve(&self, mut stop_rx: watch::Receiver<bool>) -> Result<(), AgentError> {
        let (client, mut eventloop) = AsyncClient::new(self.settings.options(), 64);
        let mut connected = false;
        let mut unsubscribed: Vec<String> = Vec::new();

        info!(
            broker = %format!("{}:{}", self.settings.host, self.settings.port),
            base = %self.settings.base_topic,
            "MQTT listener connecting"
        );

        loop {
            // The request queue drains only while the event loop is polled
            subscribe_pending(&client, &mut unsubscribed);

            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        unsubscribed = vec![self.topics.execute.clone(), self.topics.commands.clone()];
                        if !connected {
                            connected = true;
                            self.control.bound();
                            info!(topic = %self.topics.execute, "MQTT listener running");
                        } else {
                            info!("MQTT session re-established");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.dispatch(&client, publish.topic, publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) if !connected => {
                        return Err(self.control.failure(format!("broker connection failed: {e}")));
                    }
                    Err(e) => {
                        warn!("MQTT connection lost: {}, retrying", e);
                        if pause(&mut stop_rx, RECONNECT_DELAY).await {
                            break;
                        }
                    }
                },
                _ = async { let _ = stop_rx.wait_for(|&stop| stop).await; } => break,
            }
        }

        disconnect(&client, &mut eventloop).await;
        info!("MQTT listener drained");
        Ok(())
    }
}

/// Queue a SUBSCRIBE for every topic without waiting on the request queue
///
/// Topics whose request did not fit stay in `pending` for the next pass.
fn subscribe_pending(client: &AsyncClient, pending: &mut Vec<String>) {
    pending.retain(|topic| match client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
        Ok(()) => false,
        Err(e) => {
            debug!(topic = %topic, "subscribe deferred: {}", e);
            true
        }
    });
}

/// Sleep for `delay` unless a stop arrives first; true when stopped
async fn pause(stop_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    let stopped = async { stop_rx.wait_for(|&stop| stop).await.is_ok() };
    tokio::time::timeout(delay, stopped).await.unwrap_or(false)
}

/// Send DISCONNECT and drive the event loop until it goes out
async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(e) = client.disconnect().await {
        debug!("MQTT disconnect request failed: {}", e);
        return;
    }
    let drain = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    if tokio::time::timeout(DISCONNECT_GRACE, drain).await.is_err() {
        error!("MQTT disconnect did not complete in time");
    }
}

#[async_trait]
impl Listener for MqttListener {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state(&self) -> ListenerState {
        self.control.state()
    }

    async fn start(&self) -> Result<(), AgentError> {
        let stop_rx = self.control.begin()?;
        let result = self.serve(stop_rx).await;
        self.control.finish(result)
    }

    async fn stop(&self) {
        self.control.request_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::catalog_tests::SAMPLE;
    use crate::command::test_support::{open_policy, service_with};
    use deskctl_shared::codec::ResponseKind;

    fn topics() -> Topics {
        Topics::new("deskctl")
    }

    #[test]
    fn test_topics() {
        let t = Topics::new("home/desk/");
        assert_eq!(t.execute, "home/desk/execute");
        assert_eq!(t.commands, "home/desk/commands");
        assert_eq!(t.response, "home/desk/response");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_reply_carries_correlation_id() {
        let service = service_with(SAMPLE, "linux", open_policy());
        let reply = handle_message(
            &service,
            &topics(),
            "deskctl/execute",
            br#"{"correlationId":"abc","commandId":"echo"}"#,
        )
        .await
        .unwrap();

        assert_eq!(reply.correlation_id, "abc");
        assert_eq!(reply.kind, ResponseKind::ExecuteResult);
        assert!(reply.success);
        let result = reply.result.unwrap();
        assert_eq!(result.output, "hello");
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_rejection_becomes_error_reply() {
        let service = service_with(SAMPLE, "linux", open_policy());
        let reply = handle_message(
            &service,
            &topics(),
            "deskctl/execute",
            br#"{"correlationId":"r-9","commandId":"sequence","pin":"0000"}"#,
        )
        .await
        .unwrap();

        assert_eq!(reply.correlation_id, "r-9");
        assert_eq!(reply.kind, ResponseKind::Error);
        assert!(!reply.success);
        assert_eq!(reply.error.unwrap().code, "invalid_or_missing_pin");
    }

    #[tokio::test]
    async fn test_undecodable_payloads_still_get_replies() {
        let service = service_with(SAMPLE, "linux", open_policy());

        let reply = handle_message(&service, &topics(), "deskctl/execute", b"not json")
            .await
            .unwrap();
        assert_eq!(reply.correlation_id, "");
        assert_eq!(reply.error.unwrap().code, "malformed_payload");

        let reply = handle_message(
            &service,
            &topics(),
            "deskctl/execute",
            br#"{"correlationId":"c-2"}"#,
        )
        .await
        .unwrap();
        assert_eq!(reply.correlation_id, "c-2");
        assert_eq!(reply.error.unwrap().code, "missing_field");
    }

    #[tokio::test]
    async fn test_commands_reply() {
        let service = service_with(SAMPLE, "linux", open_policy());
        let reply = handle_message(
            &service,
            &topics(),
            "deskctl/commands",
            br#"{"correlationId":"list-1"}"#,
        )
        .await
        .unwrap();

        assert_eq!(reply.kind, ResponseKind::Commands);
        let commands = reply.commands.unwrap();
        assert_eq!(commands.len(), 4);
        assert_eq!(commands[0].category, "audio");
    }

    #[tokio::test]
    async fn test_lookup_failures_become_error_replies() {
        let service = service_with(SAMPLE, "linux", open_policy());

        let reply = handle_message(
            &service,
            &topics(),
            "deskctl/execute",
            br#"{"correlationId":"n-1","commandId":"nope"}"#,
        )
        .await
        .unwrap();
        assert_eq!(reply.correlation_id, "n-1");
        assert_eq!(reply.kind, ResponseKind::Error);
        assert_eq!(reply.error.unwrap().code, "command_not_found");

        let reply = handle_message(
            &service,
            &topics(),
            "deskctl/execute",
            br#"{"correlationId":"m-1","commandId":"mute"}"#,
        )
        .await
        .unwrap();
        assert_eq!(reply.correlation_id, "m-1");
        assert!(!reply.success);
        assert_eq!(reply.error.unwrap().code, "command_unavailable_on_platform");
    }

    #[tokio::test]
    async fn test_foreign_topic_is_ignored() {
        let service = service_with(SAMPLE, "linux", open_policy());
        assert!(handle_message(&service, &topics(), "deskctl/response", b"{}")
            .await
            .is_none());
    }

    #[test]
    fn test_full_request_queue_defers_subscriptions() {
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "127.0.0.1", 1), 1);
        let t = topics();
        let mut pending = vec![t.execute.clone(), t.commands.clone()];

        // Nothing polls the event loop, so only one request fits
        subscribe_pending(&client, &mut pending);
        assert_eq!(pending, [t.commands.clone()]);

        subscribe_pending(&client, &mut pending);
        assert_eq!(pending, [t.commands]);
    }

    #[tokio::test]
    async fn test_pause_ends_early_on_stop() {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stop_tx.send_replace(true);
            // Keep the sender alive until the pause has seen the stop
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let started = std::time::Instant::now();
        assert!(pause(&mut stop_rx, Duration::from_secs(30)).await);
        assert!(started.elapsed() < Duration::from_secs(5));

        let (_stop_tx, mut stop_rx) = watch::channel(false);
        assert!(!pause(&mut stop_rx, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_serve_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let service = service_with(SAMPLE, "linux", open_policy());
        let listener = MqttListener::new(MqttSettings::from(&AgentConfig::default()), service);
        let (_stop_tx, stop_rx) = watch::channel(true);
        let serve = listener.serve(stop_rx);
        assert_send(&serve);
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_start() {
        let service = service_with(SAMPLE, "linux", open_policy());
        let listener = MqttListener::new(
            MqttSettings {
                host: "127.0.0.1".into(),
                port: 1,
                client_id: "test".into(),
                username: None,
                password: None,
                base_topic: "deskctl".into(),
            },
            service,
        );

        let result = tokio::time::timeout(Duration::from_secs(10), listener.start())
            .await
            .unwrap();
        assert!(matches!(result, Err(AgentError::ListenerStartFailed { listener: "mqtt", .. })));
        assert_eq!(listener.state(), ListenerState::Stopped);
    }
}
