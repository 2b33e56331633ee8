//! WebSocket Handler
//!
//! One socket per session. The first `Register` frame binds the socket to an
//! identity on the switchboard; `Send` frames are then routed on its behalf.
//!
//! Registration is only checked against the account table: an id that no
//! account holds is refused. The frame carries no credential, so a client
//! that knows another account's id can still register as it. Logins hand
//! out no token to present here.

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use diligent_session::{ClientFrame, IdentityId, ServerFrame};

use crate::metrics::ServerMetrics;
use crate::repository::Repository;
use crate::router::{ConnId, Switchboard};

/// Drive one websocket until either side goes away.
pub async fn handle_socket(
    socket: WebSocket,
    switchboard: Arc<Switchboard>,
    repository: Arc<Repository>,
    metrics: Arc<ServerMetrics>,
    outbound_buffer: usize,
) {
    metrics.connection_opened();
    let conn_id = switchboard.next_connection_id();
    info!(conn_id, "New websocket connection");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(outbound_buffer.max(1));

    // Task to send frames to the websocket
    let sender_task = async move {
        while let Some(frame) = rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize frame: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    };

    let mut registered: Option<IdentityId> = None;
    let input_task = async {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => {
                        handle_frame(
                            conn_id,
                            frame,
                            &mut registered,
                            &tx,
                            &switchboard,
                            &repository,
                            &metrics,
                        )
                        .await
                    }
                    Err(e) => {
                        metrics.frame_rejected();
                        debug!(conn_id, error = %e, "Malformed frame");
                        reply(&tx, ServerFrame::Error {
                            message: format!("malformed frame: {e}"),
                        })
                        .await;
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    metrics.websocket_error();
                    warn!(conn_id, error = %e, "WebSocket error");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!(conn_id, "Sender task ended"),
        _ = input_task => debug!(conn_id, "Input task ended"),
    }

    if let Some(user_id) = registered {
        switchboard.unregister(&user_id, conn_id).await;
    }
    metrics.connection_closed();
    info!(conn_id, "WebSocket connection closed");
}

async fn handle_frame(
    conn_id: ConnId,
    frame: ClientFrame,
    registered: &mut Option<IdentityId>,
    tx: &mpsc::Sender<ServerFrame>,
    switchboard: &Switchboard,
    repository: &Repository,
    metrics: &ServerMetrics,
) {
    match frame {
        ClientFrame::Register { user_id } => {
            match repository.get_user(user_id.as_str()).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    metrics.frame_rejected();
                    warn!(conn_id, user = %user_id, "Register for unknown identity");
                    reply(tx, ServerFrame::Error {
                        message: "unknown identity".to_string(),
                    })
                    .await;
                    return;
                }
                Err(e) => {
                    error!(conn_id, error = %e, "Identity lookup failed");
                    reply(tx, ServerFrame::Error {
                        message: "registration unavailable".to_string(),
                    })
                    .await;
                    return;
                }
            }
            if let Some(previous) = registered.take() {
                if previous != user_id {
                    switchboard.unregister(&previous, conn_id).await;
                }
            }
            switchboard
                .register(conn_id, user_id.clone(), tx.clone())
                .await;
            *registered = Some(user_id.clone());
            reply(tx, ServerFrame::Registered { user_id }).await;
        }
        ClientFrame::Send { to, from, id, body } => {
            let Some(me) = registered.as_ref() else {
                metrics.frame_rejected();
                reply(tx, ServerFrame::Error {
                    message: "send before register".to_string(),
                })
                .await;
                return;
            };
            if *me != from {
                metrics.frame_rejected();
                warn!(conn_id, registered = %me, claimed = %from, "Sender mismatch");
                reply(tx, ServerFrame::Error {
                    message: "from does not match the registered identity".to_string(),
                })
                .await;
                return;
            }
            switchboard.route(&from, &to, &id, &body).await;
        }
    }
}

async fn reply(tx: &mpsc::Sender<ServerFrame>, frame: ServerFrame) {
    if tx.send(frame).await.is_err() {
        debug!("Reply dropped - connection closing");
    }
}
