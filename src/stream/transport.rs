// =============================================================================
// Transport: socket connection exposed as a pair of channels
// =============================================================================
//
// The session logic only sees `TransportEvent`s coming in and `Outbound`
// commands going out.  The WebSocket implementation pumps both directions on
// two tasks; tests substitute in-memory links.
// =============================================================================

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::FeedResult;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Frame(Vec<u8>),
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Binary(Vec<u8>),
    Close,
}

/// One live connection.  Dropping `outbound` closes the writer side.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> FeedResult<Link>;
}

/// tokio-tungstenite backed transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> FeedResult<Link> {
        info!(url = %url, "connecting to feed socket");
        let (ws_stream, _response) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let _ = in_tx.send(TransportEvent::Open);

        tokio::spawn(async move {
            while let Some(cmd) = out_rx.recv().await {
                match cmd {
                    Outbound::Binary(bytes) => {
                        if let Err(e) = write.send(Message::Binary(bytes)).await {
                            warn!(error = %e, "socket write failed");
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        let _ = write.close().await;
                        break;
                    }
                }
            }
            debug!("socket writer exited");
        });

        tokio::spawn(async move {
            loop {
                let event = match read.next().await {
                    Some(Ok(Message::Binary(bytes))) => TransportEvent::Frame(bytes),
                    Some(Ok(Message::Text(text))) => TransportEvent::Frame(text.into_bytes()),
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.into_owned()))
                            .unwrap_or((None, String::new()));
                        let _ = in_tx.send(TransportEvent::Closed { code, reason });
                        break;
                    }
                    // tungstenite answers pings itself.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let _ = in_tx.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                    None => {
                        let _ = in_tx.send(TransportEvent::Closed {
                            code: None,
                            reason: "stream ended".into(),
                        });
                        break;
                    }
                };
                if in_tx.send(event).is_err() {
                    break;
                }
            }
            debug!("socket reader exited");
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
