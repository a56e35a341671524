//! Websocket transport to a `collab-relay`.
//!
//! One connection carries every topic. Local subscribers are fanned out
//! through a private [`TopicHub`]; the relay only learns about a topic when
//! its first local subscriber appears.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::hub::TopicHub;
use super::protocol::{ClientFrame, FrameProtocol, ServerFrame, PROTOCOL_VERSION};
use super::{ChannelEvent, ChannelTransport, Subscription, TransportError, TransportResult};

pub struct WsTransport {
    client_id: String,
    outgoing: mpsc::UnboundedSender<ClientFrame>,
    local: Arc<TopicHub>,
    connected: Arc<AtomicBool>,
}

impl WsTransport {
    /// Connect and complete the hello/welcome handshake
    pub async fn connect(url: &str) -> TransportResult<Self> {
        let client_id = crate::new_id();
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = stream.split();

        let hello = FrameProtocol::encode_client(&ClientFrame::Hello {
            protocol_version: PROTOCOL_VERSION,
            client_id: client_id.clone(),
        })?;
        ws_sender
            .send(Message::Binary(hello.to_vec()))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Binary(data))) => match FrameProtocol::decode_server(&data)? {
                    ServerFrame::Welcome { .. } => break,
                    ServerFrame::Error { message, .. } => {
                        return Err(TransportError::Connect(message));
                    }
                    other => debug!("Ignoring frame before welcome: {:?}", other),
                },
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Connect(e.to_string())),
                None => return Err(TransportError::Closed),
            }
        }
        info!("Connected to relay {} as {}", url, client_id);

        let (outgoing, mut rx) = mpsc::unbounded_channel::<ClientFrame>();
        let local = Arc::new(TopicHub::new());
        let connected = Arc::new(AtomicBool::new(true));

        // Writer: frames from the transport to the socket
        let writer_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match FrameProtocol::encode_client(&frame) {
                    Ok(bytes) => {
                        if ws_sender.send(Message::Binary(bytes.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to encode frame: {}", e),
                }
            }
            writer_connected.store(false, Ordering::SeqCst);
            let _ = ws_sender.close().await;
        });

        // Reader: deliveries from the relay to local subscribers
        let reader_hub = local.clone();
        let reader_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(Ok(msg)) = ws_receiver.next().await {
                let Message::Binary(data) = msg else {
                    continue;
                };
                match FrameProtocol::decode_server(&data) {
                    Ok(ServerFrame::Deliver(notification)) => {
                        reader_hub.publish(notification);
                    }
                    Ok(ServerFrame::Error { code, message }) => {
                        warn!("Relay error {:?}: {}", code, message);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Failed to decode frame: {}", e),
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            debug!("Relay connection closed");
        });

        Ok(Self {
            client_id,
            outgoing,
            local,
            connected,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, frame: ClientFrame) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.outgoing.send(frame).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl ChannelTransport for WsTransport {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn subscribe(&self, topic: &str) -> TransportResult<Subscription> {
        let first = self.local.subscriber_count(topic) == 0;
        let (id, rx) = self.local.subscribe(topic);
        if first {
            if let Err(e) = self.send(ClientFrame::Subscribe {
                topic: topic.to_string(),
            }) {
                self.local.unsubscribe(topic, id);
                return Err(e);
            }
        }
        Ok(Subscription::new(topic, id, rx))
    }

    async fn publish(&self, topic: &str, event: ChannelEvent) -> TransportResult<()> {
        self.send(ClientFrame::Publish {
            topic: topic.to_string(),
            event,
        })
    }

    async fn unsubscribe(&self, subscription: Subscription) -> TransportResult<()> {
        if self.local.unsubscribe(&subscription.topic, subscription.id) && self.is_connected() {
            self.send(ClientFrame::Unsubscribe {
                topic: subscription.topic,
            })?;
        }
        Ok(())
    }
}
