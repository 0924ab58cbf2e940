use crate::event::{Inbound, SendMessageAction};
use crate::outbound::{FrameKind, FrameSink, OutboundWriter, TransportError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;
use uuid::Uuid;
use yume_core::{Expression, UserId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of the OneBot websocket.
pub type WsSink = SplitSink<WsStream, Message>;

#[async_trait]
impl FrameSink for WsSink {
    async fn write_frame(&mut self, kind: FrameKind, payload: Vec<u8>) -> Result<(), TransportError> {
        let message = match kind {
            FrameKind::Text => Message::Text(
                String::from_utf8(payload).map_err(|e| TransportError::Payload(e.to_string()))?,
            ),
            FrameKind::Ping => Message::Ping(payload),
            FrameKind::Close => Message::Close(None),
        };
        self.send(message).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match SinkExt::close(self).await {
            Ok(())
            | Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Read half of the OneBot websocket.
pub struct EventReader {
    stream: SplitStream<WsStream>,
}

impl EventReader {
    /// Next decoded frame. `None` once the connection is gone.
    ///
    /// Frames that fail to decode are logged and skipped.
    pub async fn next(&mut self) -> Option<Inbound> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!("OneBot read failed: {}", e);
                    return None;
                }
            };
            match message {
                Message::Text(text) => match Inbound::parse(&text) {
                    Ok(inbound) => return Some(inbound),
                    Err(e) => tracing::warn!("Undecodable OneBot frame: {}", e),
                },
                Message::Close(frame) => {
                    tracing::info!("OneBot closed the connection: {:?}", frame);
                    return None;
                }
                _ => {}
            }
        }
    }
}

/// Dial the OneBot websocket, authenticating with a bearer token if given.
pub async fn connect(
    ws_url: &str,
    access_token: Option<&str>,
) -> Result<(Arc<OutboundWriter<WsSink>>, EventReader)> {
    let url = Url::parse(ws_url).context("Invalid OneBot WS URL")?;
    tracing::info!("Connecting to OneBot at {}...", url);

    let mut request = url
        .as_str()
        .into_client_request()
        .context("Failed to build websocket request")?;
    if let Some(token) = access_token.filter(|t| !t.is_empty()) {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .context("Access token is not a valid header value")?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (stream, _) = connect_async(request)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;
    tracing::info!("Connected to OneBot!");

    let (sink, stream) = stream.split();
    Ok((Arc::new(OutboundWriter::new(sink)), EventReader { stream }))
}

/// Sends private messages through the outbound serializer.
///
/// A reply containing `$` goes out as several messages, each after a short
/// random pause so it reads like someone typing.
pub struct PrivateSender<S: FrameSink> {
    outbound: Arc<OutboundWriter<S>>,
    min_delay: Duration,
    max_delay: Duration,
}

impl<S: FrameSink> PrivateSender<S> {
    pub fn new(outbound: Arc<OutboundWriter<S>>) -> Self {
        Self {
            outbound,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
        }
    }

    pub fn with_delay(mut self, min: Duration, max: Duration) -> Self {
        self.min_delay = min;
        self.max_delay = max.max(min);
        self
    }

    fn pause(&self) -> Duration {
        if self.max_delay <= self.min_delay {
            return self.min_delay;
        }
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..max))
    }
}

/// Non-empty segments of a `$`-separated reply.
pub fn split_segments(message: &str) -> Vec<&str> {
    message
        .split('$')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[async_trait]
impl<S: FrameSink> Expression for PrivateSender<S> {
    async fn speak(&self, user_id: UserId, message: &str) -> Result<()> {
        for segment in split_segments(message) {
            let pause = self.pause();
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            let action = SendMessageAction::private(user_id, segment, Uuid::new_v4().to_string());
            let payload = serde_json::to_vec(&action)?;
            self.outbound
                .enqueue(FrameKind::Text, &payload)
                .await
                .with_context(|| format!("Failed to send message to {}", user_id))?;
            tracing::info!("Sent to {}: {}", user_id, segment);
        }
        Ok(())
    }
}
