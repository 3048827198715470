//! WebSocket connection to the realtime API
//!
//! The socket is split into a writer task and a reader task. The turn
//! controller only ever sees a synchronous [`RealtimeSink`]; inbound
//! messages arrive on an mpsc receiver that the runtime selects on.

use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use super::protocol::{ClientEvent, ServerEvent};
use crate::config::RealtimeConfig;
use crate::{Error, Result};

/// Outbound half of the realtime channel as seen by the controller
pub trait RealtimeSink {
    /// Queue a message for the remote API
    ///
    /// # Errors
    ///
    /// Returns [`Error::Channel`] once the channel has closed
    fn send(&mut self, event: ClientEvent) -> Result<()>;
}

/// Inbound notifications from the reader task
#[derive(Debug)]
pub enum ChannelEvent {
    /// A parsed server message
    Message(ServerEvent),
    /// The socket closed or failed
    Closed(Option<String>),
}

/// Sender handle backed by the writer task
#[derive(Debug, Clone)]
pub struct RealtimeSender {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl RealtimeSender {
    /// Wrap an outbound queue
    #[must_use]
    pub const fn new(tx: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self { tx }
    }
}

impl RealtimeSink for RealtimeSender {
    fn send(&mut self, event: ClientEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|e| Error::Channel(format!("realtime channel closed, dropped {}", e.0.kind())))
    }
}

/// An open realtime connection
pub struct RealtimeConnection {
    /// Outbound messages
    pub sender: RealtimeSender,
    /// Inbound messages and close notification
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
    shutdown: oneshot::Sender<()>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl RealtimeConnection {
    /// Open the socket and start the reader and writer tasks
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be built or the handshake fails
    pub async fn connect(config: &RealtimeConfig) -> Result<Self> {
        let url = url::Url::parse_with_params(&config.url, &[("model", config.model.as_str())])
            .map_err(|e| Error::Config(format!("invalid realtime url: {e}")))?;

        let mut request = url.as_str().into_client_request()?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", config.api_key.expose_secret()))
            .map_err(|e| Error::Config(format!("invalid api key: {e}")))?;
        request.headers_mut().insert("Authorization", auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        tracing::info!(model = %config.model, "realtime channel connected");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let writer = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = &mut shutdown_rx => break,
                    event = out_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(error = %e, kind = event.kind(), "failed to encode message");
                        continue;
                    }
                };
                if let Err(e) = ws_write.send(WsMessage::Text(json)).await {
                    tracing::warn!(error = %e, "realtime send failed");
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                match ws_read.next().await {
                    Some(Ok(WsMessage::Text(text))) => match ServerEvent::parse(&text) {
                        Ok(event) => {
                            if in_tx.send(ChannelEvent::Message(event)).is_err() {
                                return;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "ignoring inbound message"),
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        break frame.map(|f| f.reason.to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "realtime receive failed");
                        break Some(e.to_string());
                    }
                    None => break None,
                }
            };
            let _ = in_tx.send(ChannelEvent::Closed(reason));
        });

        Ok(Self {
            sender: RealtimeSender::new(out_tx),
            events: in_rx,
            shutdown: shutdown_tx,
            writer,
            reader,
        })
    }

    /// Close the socket and stop both tasks
    pub async fn close(self) {
        let Self {
            sender,
            events,
            shutdown,
            writer,
            reader,
        } = self;

        drop(sender);
        drop(events);
        let _ = shutdown.send(());
        if tokio::time::timeout(std::time::Duration::from_secs(2), writer).await.is_err() {
            tracing::debug!("realtime writer did not finish in time");
        }
        reader.abort();
        tracing::debug!("realtime channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_fails_after_close() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sender = RealtimeSender::new(tx);

        assert!(sender.send(ClientEvent::ResponseCreate).is_ok());
        drop(rx);
        assert!(matches!(sender.send(ClientEvent::ResponseCreate), Err(Error::Channel(_))));
    }
}
