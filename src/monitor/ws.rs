//! WebSocket transport for the push channel.
//!
//! Each connection gets one bridge task translating between the typed
//! message channels of [`PushConnection`] and JSON text frames. The bridge
//! ends, closing the inbound channel, when either side goes away.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::push::{InboundMessage, OutboundMessage, PushConnection, PushConnector};
use crate::error::MonitorError;

pub struct WsPushConnector {
    url: String,
    connect_timeout: Duration,
}

impl WsPushConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl PushConnector for WsPushConnector {
    async fn connect(&self) -> Result<PushConnection, MonitorError> {
        let (stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| MonitorError::PushConnectFailed("connect timed out".into()))?
            .map_err(|e| MonitorError::PushConnectFailed(e.to_string()))?;
        debug!(url = %self.url, "push socket open");

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<InboundMessage>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = out_rx.recv() => {
                        let Some(message) = outbound else {
                            let _ = sink.close().await;
                            break;
                        };
                        let text = match serde_json::to_string(&message) {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(error = %err, "outbound push message not serialisable");
                                continue;
                            }
                        };
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    frame = source.next() => match frame {
                        Some(Ok(Message::Text(text))) => match serde_json::from_str::<InboundMessage>(&text) {
                            Ok(message) => {
                                if in_tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(err) => debug!(error = %err, payload = %text, "unrecognised push frame"),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(error = %err, "push socket error");
                            break;
                        }
                    },
                }
            }
            debug!("push socket closed");
        });

        Ok(PushConnection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn next_json(
        ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    ) -> serde_json::Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn bridges_frames_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();

            let auth = next_json(&mut ws).await;
            assert_eq!(auth["type"], "authenticate");
            assert_eq!(auth["token"], "secret");
            ws.send(Message::Text(r#"{"type":"authenticated","userId":"u1"}"#.into()))
                .await
                .unwrap();

            let sub = next_json(&mut ws).await;
            assert_eq!(sub["type"], "subscribe-assessment");
            assert_eq!(sub["jobId"], "job-9");
            ws.send(Message::Text("not json".into())).await.unwrap();
            ws.send(Message::Text(
                r#"{"type":"analysis-complete","jobId":"job-9","resultId":"res-9"}"#.into(),
            ))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
        });

        let connector = WsPushConnector::new(format!("ws://{addr}"), Duration::from_secs(5));
        let mut conn = connector.connect().await.unwrap();
        conn.outbound
            .send(OutboundMessage::Authenticate {
                token: "secret".into(),
            })
            .unwrap();
        assert_eq!(
            conn.inbound.recv().await.unwrap(),
            InboundMessage::Authenticated {
                user_id: Some("u1".into())
            }
        );

        conn.outbound
            .send(OutboundMessage::Subscribe {
                job_id: "job-9".into(),
            })
            .unwrap();
        let event = conn.inbound.recv().await.unwrap().into_event().unwrap();
        assert_eq!(event.kind.result_id(), Some("res-9"));

        // Server closed the socket: the inbound side ends.
        assert!(conn.inbound.recv().await.is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = WsPushConnector::new(format!("ws://{addr}"), Duration::from_secs(5));
        assert!(matches!(
            connector.connect().await,
            Err(MonitorError::PushConnectFailed(_))
        ));
    }
}
