use crate::traits::*;
use async_trait::async_trait;
use futures::{future, SinkExt, StreamExt};
use std::sync::Arc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::{http, Message};
use tracing::{debug, warn};

/// WebSocket transport backed by tokio-tungstenite
///
/// Protocol-level ping/pong and close frames are handled by tungstenite and
/// never surface as [`Frame`]s.
#[derive(Clone, Default)]
pub struct WebSocketTransport {
    headers: Option<Arc<dyn HeaderProvider>>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach upgrade headers, resolved again on every connection attempt
    pub fn with_headers<H: HeaderProvider + 'static>(provider: H) -> Self {
        Self::from_provider(Arc::new(provider))
    }

    pub fn from_provider(provider: Arc<dyn HeaderProvider>) -> Self {
        Self {
            headers: Some(provider),
        }
    }

    async fn build_request(&self, url: &str) -> Result<Request> {
        let mut request = url
            .into_client_request()
            .map_err(|e| RealtimeError::Configuration(format!("invalid url '{}': {}", url, e)))?;

        if let Some(ref provider) = self.headers {
            for (key, value) in provider.get_headers().await {
                match key.parse::<http::header::HeaderName>() {
                    Ok(header_name) => match value.parse::<http::header::HeaderValue>() {
                        Ok(header_value) => {
                            request.headers_mut().insert(header_name, header_value);
                        }
                        Err(_) => warn!("Invalid header value for key '{}'", key),
                    },
                    Err(_) => warn!("Invalid header name: {}", key),
                }
            }
            debug!("Connecting with custom headers");
        }

        Ok(request)
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(bytes) => Message::Binary(bytes),
    }
}

fn to_frame(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text)),
        Message::Binary(bytes) => Some(Frame::Binary(bytes)),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
        Message::Close(close) => {
            debug!("Received close frame: {:?}", close);
            None
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<(FrameSink, FrameStream)> {
        let request = self.build_request(url).await?;
        let (ws_stream, _response) = connect_async(request)
            .await
            .map_err(|e| RealtimeError::ConnectionRefused(e.to_string()))?;

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| RealtimeError::WebSocket(e.to_string()))
            .with(|frame: Frame| future::ready(Ok::<Message, RealtimeError>(to_message(frame))));

        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(message) => to_frame(message).map(Ok),
                Err(e) => Some(Err(RealtimeError::WebSocket(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}
