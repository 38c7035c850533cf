//! WebSocket read/write pumps for [`ChannelTransport`](crate::ChannelTransport).

use std::collections::HashMap;
use std::sync::Arc;

use chunkferry_protocol::Message;
use chunkferry_protocol::constants::WS_PONG_WAIT;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Requests awaiting a reply, keyed by message id.
pub(crate) type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

/// Routes replies to their pending requests until the connection dies.
///
/// Any incoming frame resets the read deadline; the server pings often
/// enough that silence for [`WS_PONG_WAIT`] means the peer is gone. On
/// exit every pending request is dropped so its caller sees `Closed`.
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: PendingMap,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut deadline => {
                warn!("no traffic from receiver, closing channel");
                break;
            }

            msg = read.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                };
                deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                match msg {
                    tungstenite::Message::Text(text) => route_reply(&text, &pending).await,
                    tungstenite::Message::Ping(data) => {
                        let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                    }
                    tungstenite::Message::Close(_) => {
                        debug!("receiver closed the channel");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    cancel.cancel();
    pending.lock().await.clear();
}

async fn route_reply(text: &str, pending: &PendingMap) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse message: {e}");
            return;
        }
    };
    trace!(msg_type = ?msg.msg_type, id = %msg.id, "received message");

    match pending.lock().await.remove(&msg.id) {
        Some(tx) => {
            let _ = tx.send(msg);
        }
        None => debug!(id = %msg.id, "reply for unknown request dropped"),
    }
}

/// Serialises outbound frames onto the socket.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = write.send(msg).await {
                    error!("WebSocket write error: {e}");
                    break;
                }
            }
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
}
