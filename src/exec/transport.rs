// src/exec/transport.rs

//! Topic based message transport between the scheduler and ants.
//!
//! [`ChannelTransport`] is the in-process implementation: every topic maps
//! to the mpsc senders of its subscribers. Pumps translate the response and
//! registration topics into [`RuntimeEvent`]s.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::RuntimeEvent;
use crate::errors::{FormicaryError, Result};
use crate::resource::AntRegistration;

/// One published payload. `key` identifies the sender or the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub key: String,
    pub payload: Vec<u8>,
}

pub trait Transport: Send + Sync {
    /// Deliver `message` to every subscriber of `topic`.
    fn publish(
        &self,
        topic: &str,
        message: Message,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    fn subscribe(&self, topic: &str) -> mpsc::Receiver<Message>;
}

#[derive(Debug)]
pub struct ChannelTransport {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<Message>>>>,
    capacity: usize,
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new(64)
    }
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribers(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Transport for ChannelTransport {
    fn publish(
        &self,
        topic: &str,
        message: Message,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        // Clone the senders so the lock is not held across `await`.
        let senders: Vec<mpsc::Sender<Message>> = {
            let mut topics = self.topics.lock();
            match topics.get_mut(topic) {
                Some(subs) => {
                    subs.retain(|s| !s.is_closed());
                    subs.clone()
                }
                None => Vec::new(),
            }
        };
        let topic = topic.to_string();

        Box::pin(async move {
            if senders.is_empty() {
                return Err(FormicaryError::Protocol(format!(
                    "no subscriber for topic '{topic}'"
                )));
            }
            for tx in senders {
                tx.send(message.clone()).await.map_err(|_| {
                    FormicaryError::Protocol(format!("subscriber of topic '{topic}' went away"))
                })?;
            }
            Ok(())
        })
    }

    fn subscribe(&self, topic: &str) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        debug!(topic, "subscribed");
        rx
    }
}

/// Forward sealed task responses published on `topic` to the runtime.
/// The message key is the responding ant.
pub fn spawn_response_pump(
    transport: &dyn Transport,
    topic: &str,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
) -> JoinHandle<()> {
    let mut rx = transport.subscribe(topic);
    let topic = topic.to_string();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let event = RuntimeEvent::ResponseReceived {
                ant_id: message.key,
                payload: message.payload,
            };
            if runtime_tx.send(event).await.is_err() {
                break;
            }
        }
        info!(topic = %topic, "response pump finished");
    })
}

/// Forward ant heartbeats published on `topic` to the runtime.
pub fn spawn_registration_pump(
    transport: &dyn Transport,
    topic: &str,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
) -> JoinHandle<()> {
    let mut rx = transport.subscribe(topic);
    let topic = topic.to_string();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let registration = match AntRegistration::unmarshal(&message.payload) {
                Ok(registration) => registration,
                Err(err) => {
                    warn!(key = %message.key, error = %err, "dropping invalid ant registration");
                    continue;
                }
            };
            if runtime_tx
                .send(RuntimeEvent::AntHeartbeat(registration))
                .await
                .is_err()
            {
                break;
            }
        }
        info!(topic = %topic, "registration pump finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(key: &str) -> Message {
        Message {
            key: key.into(),
            payload: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn publish_fans_out_to_subscribers() {
        let transport = ChannelTransport::default();
        let mut a = transport.subscribe("jobs");
        let mut b = transport.subscribe("jobs");

        transport.publish("jobs", message("k")).await.unwrap();

        assert_eq!(a.recv().await.unwrap().key, "k");
        assert_eq!(b.recv().await.unwrap().key, "k");
    }

    #[tokio::test]
    async fn publish_without_subscriber_fails() {
        let transport = ChannelTransport::default();
        let err = transport.publish("nobody", message("k")).await.unwrap_err();
        assert!(matches!(err, FormicaryError::Protocol(_)));

        let rx = transport.subscribe("gone");
        drop(rx);
        assert_eq!(transport.subscribers("gone"), 0);
        assert!(transport.publish("gone", message("k")).await.is_err());
    }

    #[tokio::test]
    async fn registration_pump_emits_heartbeats() {
        let transport = ChannelTransport::default();
        let (tx, mut rx) = mpsc::channel(4);
        let _pump = spawn_registration_pump(&transport, "registrations", tx);

        let registration =
            AntRegistration::new("ant-9", vec![crate::types::TaskMethod::Shell], 1);
        let payload = registration.marshal().unwrap();
        transport
            .publish(
                "registrations",
                Message {
                    key: "ant-9".into(),
                    payload,
                },
            )
            .await
            .unwrap();

        match rx.recv().await {
            Some(RuntimeEvent::AntHeartbeat(reg)) => assert_eq!(reg.ant_id, "ant-9"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
