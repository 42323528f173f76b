//! # AudioHook WebSocket Endpoint
//!
//! Accepts AudioHook connections on `/{channelId}/{transactionId}/...` and
//! runs one `AudiohookSocket` actor per connection.
//!
//! ## Connection Protocol:
//! 1. **Upgrade**: the path must carry a channel and a transaction id, and the
//!    request must pass the configured `Authenticator`; otherwise the request
//!    is answered with a bare 400/401 and the TCP connection is closed
//! 2. **Open**: the actor registers a session keyed by the connection id,
//!    using the `audiohook-session-id` header as the session identifier
//! 3. **Streaming**: binary frames carry audio, text frames carry JSON control
//!    messages; both go through the `ConnectionRegistry`
//! 4. **Results**: recognizer events come back through the actor mailbox and
//!    leave as `transcript` messages
//! 5. **Close**: client close, protocol error or heartbeat timeout all stop
//!    the actor, which destroys the session
//!
//! ## Actor Model:
//! WebSocket frames, recognizer events and outbound messages are all
//! delivered to the same actor, so everything for one connection runs one
//! message at a time in arrival order.

use crate::auth::{UpgradeRequest, Verdict};
use crate::error::AppError;
use crate::protocol::{ClientSink, Outbound};
use crate::registry::{Connection, ConnectionRegistry, Frame, FrameOutcome, OpenOutcome, RoutingIds};
use crate::speech::WindowEvent;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// Header carrying the external session identifier.
pub const SESSION_ID_HEADER: &str = "audiohook-session-id";

/// Actor for one AudioHook connection.
pub struct AudiohookSocket {
    connection: Connection,
    registry: Arc<ConnectionRegistry>,
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl AudiohookSocket {
    pub fn new(
        connection: Connection,
        registry: Arc<ConnectionRegistry>,
        heartbeat_interval: Duration,
        client_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            registry,
            last_heartbeat: Instant::now(),
            heartbeat_interval,
            client_timeout,
        }
    }

    /// Ping the client every interval; stop if it went quiet for too long.
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(
                    connection_id = %act.connection.id,
                    "WebSocket heartbeat timeout, closing connection"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn deliver(&mut self, frame: Frame<'_>, ctx: &mut ws::WebsocketContext<Self>) {
        if let FrameOutcome::Rejected(notice) = self.registry.on_frame(&self.connection, frame) {
            let message = notice.into_message(self.connection.session_id.clone());
            if let Ok(json) = serde_json::to_string(&message) {
                ctx.text(json);
            }
        }
    }
}

impl Actor for AudiohookSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            connection_id = %self.connection.id,
            channel_id = %self.connection.routing.channel_id,
            transaction_id = %self.connection.routing.transaction_id,
            session_id = ?self.connection.session_id,
            "WebSocket connection started"
        );
        self.start_heartbeat(ctx);

        let client: Arc<dyn ClientSink> = Arc::new(ctx.address().recipient::<Outbound>());
        match self.registry.on_connection_open(&mut self.connection, client) {
            OpenOutcome::Created(events) => {
                ctx.add_stream(UnboundedReceiverStream::new(events));
            }
            OpenOutcome::AlreadyRegistered
            | OpenOutcome::MissingSessionId
            | OpenOutcome::CapacityReached => {}
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let state = self.connection.state();
        self.registry.on_connection_close(&mut self.connection);
        info!(
            connection_id = %self.connection.id,
            state_at_stop = ?state,
            "WebSocket connection stopped"
        );
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AudiohookSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(bytes)) => {
                self.deliver(Frame::Binary(&bytes[..]), ctx);
            }
            Ok(ws::Message::Text(text)) => {
                self.deliver(Frame::Text(&text), ctx);
            }
            Ok(ws::Message::Ping(bytes)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&bytes);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = %self.connection.id, reason = ?reason, "WebSocket closed by client");
                self.connection.begin_closing();
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection_id = %self.connection.id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                self.registry
                    .on_connection_error(&mut self.connection, &err.to_string());
                ctx.stop();
            }
        }
    }
}

/// Recognizer events for this connection's session.
impl StreamHandler<WindowEvent> for AudiohookSocket {
    fn handle(&mut self, event: WindowEvent, _ctx: &mut Self::Context) {
        self.registry.on_window_event(&self.connection, event);
    }

    /// The session dropped its event sender; the connection itself stays up.
    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(connection_id = %self.connection.id, "Recognizer event stream finished");
    }
}

impl Handler<Outbound> for AudiohookSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        match msg {
            Outbound::Text(text) => ctx.text(text),
            Outbound::Binary(bytes) => ctx.binary(bytes),
            Outbound::Close(description) => {
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Normal,
                    description,
                }));
                ctx.stop();
            }
        }
    }
}

/// Upgrade endpoint, mounted as the default service.
///
/// ## Rejections (before any WebSocket handshake):
/// - fewer than two path segments → 400, connection closed, no body
/// - authenticator verdict negative → 401, connection closed, no body
/// - not a valid WebSocket handshake → 400
pub async fn audiohook_upgrade(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let routing = match RoutingIds::from_path(req.uri().path()) {
        Ok(routing) => routing,
        Err(err) => {
            state.registry.record_upgrade_rejected();
            warn!(path = %req.uri(), "Malformed upgrade request");
            return Err(err.into());
        }
    };

    let request = UpgradeRequest::from_http(&req);
    if let Verdict::Rejected(reason) = state.authenticator().verify(&request).await {
        state.registry.record_upgrade_rejected();
        warn!(
            channel_id = %routing.channel_id,
            transaction_id = %routing.transaction_id,
            reason = %reason,
            "Upgrade rejected by authenticator"
        );
        return Err(AppError::Unauthorized(reason));
    }

    let session_id = req
        .headers()
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    let performance = state.get_config().performance;
    let connection = Connection::new(routing, session_id, req.uri().to_string());
    let connection_id = connection.id;
    let actor = AudiohookSocket::new(
        connection,
        state.registry.clone(),
        Duration::from_secs(performance.heartbeat_interval_secs),
        Duration::from_secs(performance.client_timeout_secs),
    );

    let response = ws::start(actor, &req, stream)?;
    info!(
        connection_id = %connection_id,
        peer = ?req.connection_info().peer_addr(),
        "Upgrade accepted"
    );
    Ok(response)
}
