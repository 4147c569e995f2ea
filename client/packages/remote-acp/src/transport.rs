use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use remote_acp_error::RemoteAcpError;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::address::EndpointAddress;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = RemoteAcpError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, RemoteAcpError>> + Send>>;

/// A reliable, ordered, message-framed channel to one remote endpoint.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Transport {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens transports. The multiplexer calls this exactly once per connection
/// it establishes.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(&self, address: &EndpointAddress) -> Result<Transport, RemoteAcpError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, address: &EndpointAddress) -> Result<Transport, RemoteAcpError> {
        let (socket, response) = tokio_tungstenite::connect_async(address.url().as_str())
            .await
            .map_err(|err| map_connect_error(address, err))?;
        tracing::debug!(
            address = %address,
            status = response.status().as_u16(),
            "websocket upgrade complete"
        );

        let close_address = address.to_string();
        let (write, read) = socket.split();
        let sink = write
            .sink_map_err(move |err| {
                tracing::debug!(address = %close_address, error = %err, "websocket write failed");
                RemoteAcpError::ConnectionClosed {
                    address: close_address.clone(),
                }
            })
            .with(|text: String| future::ready(Ok::<_, RemoteAcpError>(Message::Text(text.into()))));

        let read_address = address.to_string();
        let stream = read.filter_map(move |item| {
            let address = read_address.clone();
            future::ready(match item {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        tracing::warn!(address = %address, "dropping non-utf8 binary frame");
                        None
                    }
                },
                // Close ends the stream on the next poll; control frames are
                // answered by tungstenite itself.
                Ok(_) => None,
                Err(err) => Some(Err(map_read_error(&address, err))),
            })
        });

        Ok(Transport::new(Box::pin(sink), Box::pin(stream)))
    }
}

fn map_connect_error(address: &EndpointAddress, err: tungstenite::Error) -> RemoteAcpError {
    match err {
        tungstenite::Error::Io(io) => RemoteAcpError::ConnectionRefused {
            address: address.to_string(),
            message: io.to_string(),
        },
        other => RemoteAcpError::HandshakeFailed {
            address: address.to_string(),
            message: other.to_string(),
        },
    }
}

fn map_read_error(address: &str, err: tungstenite::Error) -> RemoteAcpError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            RemoteAcpError::ConnectionClosed {
                address: address.to_string(),
            }
        }
        other => RemoteAcpError::Protocol {
            message: format!("websocket read from {address} failed: {other}"),
        },
    }
}
