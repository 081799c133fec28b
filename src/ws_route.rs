//! `/ws` upgrade route (spec.md §6). Grounded on the teacher's
//! `message_stream` SSE route for the request-guard shape — trust-based
//! identity read straight off headers, no session store — but the one-way
//! `EventStream!` is swapped for a bidirectional `rocket_ws::Channel`
//! driven by `tokio::select!` between the socket and the connection's
//! outbound queue.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::{get, State};
use rocket_ws::frame::CloseFrame;
use rocket_ws::{Channel, Message, WebSocket};
use tokio::sync::mpsc;

use crate::auth::Authenticator;
use crate::hub::{FrameOutcome, Hub, CLOSE_NORMAL};
use crate::presence::{SinkMessage, OUTBOUND_QUEUE_CAPACITY};
use crate::now_ms;

pub struct ConnectionHeaders {
    origin: Option<String>,
    user_header: Option<String>,
    name_header: Option<String>,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ConnectionHeaders {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(ConnectionHeaders {
            origin: req.headers().get_one("Origin").map(str::to_string),
            user_header: req.headers().get_one("X-Chat-User").map(str::to_string),
            name_header: req.headers().get_one("X-Chat-Name").map(str::to_string),
        })
    }
}

#[get("/ws")]
pub fn ws_connect(
    ws: WebSocket,
    headers: ConnectionHeaders,
    hub: &State<Arc<Hub>>,
    authenticator: &State<Arc<dyn Authenticator>>,
) -> Result<Channel<'static>, Status> {
    let hub = Arc::clone(hub.inner());
    let authenticator = Arc::clone(authenticator.inner());

    if !hub.is_origin_allowed(headers.origin.as_deref()) {
        return Err(Status::Forbidden);
    }

    let Some((user_id, display_name)) =
        authenticator.authenticate(headers.user_header.as_deref(), headers.name_header.as_deref())
    else {
        return Err(Status::Unauthorized);
    };

    Ok(ws.channel(move |stream| Box::pin(run_connection(hub, user_id, display_name, stream))))
}

async fn run_connection(
    hub: Arc<Hub>,
    user_id: String,
    display_name: String,
    mut stream: rocket_ws::stream::DuplexStream,
) -> Result<(), rocket_ws::result::Error> {
    let (tx, mut rx) = mpsc::channel::<SinkMessage>(OUTBOUND_QUEUE_CAPACITY);
    let sink = hub.connect(&user_id, &display_name, tx);

    let mut closed_with_code = None;

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(SinkMessage::Frame(frame)) => {
                        if stream.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    Some(SinkMessage::Close(code, reason)) => {
                        closed_with_code = Some(code);
                        let _ = send_close(&mut stream, code, reason).await;
                        break;
                    }
                    None => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(raw))) => {
                        let outcome = Hub::handle_frame(&hub, &user_id, &raw, Instant::now(), now_ms());
                        if let FrameOutcome::Close(code, reason) = outcome {
                            closed_with_code = Some(code);
                            let _ = send_close(&mut stream, code, reason).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong/binary are not part of the protocol
                    Some(Err(_)) => break,
                }
            }
        }
    }

    hub.disconnect(&user_id, &sink);
    if closed_with_code.is_none() {
        let _ = send_close(&mut stream, CLOSE_NORMAL, "connection closed").await;
    }
    Ok(())
}

async fn send_close(
    stream: &mut rocket_ws::stream::DuplexStream,
    code: u16,
    reason: &'static str,
) -> Result<(), rocket_ws::result::Error> {
    stream
        .send(Message::Close(Some(CloseFrame { code: code.into(), reason: Cow::Borrowed(reason) })))
        .await
}
