//! WebSocket module for live dashboard updates
//!
//! Each session watches the dashboard revision and pushes a fresh
//! [`DashboardUpdate`] whenever it moves, plus a one-off `SessionExpired`
//! notice once the poller has stopped.

use actix::{Actor, ActorContext, ActorFutureExt, AsyncContext, StreamHandler};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::dashboard::SharedDashboard;
use crate::models::{DashboardUpdate, WsMessage};

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How long before lack of client response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the dashboard revision is checked
const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

const SESSION_EXPIRED_MESSAGE: &str = "Sensor API session expired; live updates have stopped";

/// WebSocket session actor
pub struct WsSession {
    client_id: String,
    last_heartbeat: Instant,
    dashboard: SharedDashboard,
    last_revision: Option<u64>,
    expiry_sent: bool,
}

impl WsSession {
    pub fn new(client_id: String, dashboard: SharedDashboard) -> Self {
        Self {
            client_id,
            last_heartbeat: Instant::now(),
            dashboard,
            last_revision: None,
            expiry_sent: false,
        }
    }

    fn send(ctx: &mut ws::WebsocketContext<Self>, msg: &WsMessage) {
        if let Ok(json) = serde_json::to_string(msg) {
            ctx.text(json);
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(
                    client_id = %act.client_id,
                    "WebSocket heartbeat timeout"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn start_update_polling(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(UPDATE_CHECK_INTERVAL, |act, ctx| {
            let dashboard = act.dashboard.clone();
            let last_revision = act.last_revision;

            let fut = async move {
                let dashboard = dashboard.read().await;
                let update: Option<DashboardUpdate> = if Some(dashboard.revision()) != last_revision {
                    Some(dashboard.update())
                } else {
                    None
                };
                (update, dashboard.session_expired())
            };

            let fut = actix::fut::wrap_future::<_, Self>(fut);

            ctx.spawn(fut.map(|(update, expired), act, ctx| {
                if let Some(update) = update {
                    act.last_revision = Some(update.revision);
                    debug!(
                        client_id = %act.client_id,
                        revision = update.revision,
                        "Pushing dashboard update"
                    );
                    Self::send(ctx, &WsMessage::DashboardUpdate(update));
                }

                if expired && !act.expiry_sent {
                    act.expiry_sent = true;
                    Self::send(
                        ctx,
                        &WsMessage::SessionExpired {
                            message: SESSION_EXPIRED_MESSAGE.into(),
                        },
                    );
                }
            }));
        });
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(client_id = %self.client_id, "WebSocket connected");

        // Registered only after the handshake; `stopped` removes it again
        let dashboard = self.dashboard.clone();
        let client_id = self.client_id.clone();
        ctx.wait(actix::fut::wrap_future::<_, Self>(async move {
            dashboard.write().await.add_client(&client_id);
        }));

        self.start_heartbeat(ctx);
        self.start_update_polling(ctx);

        Self::send(
            ctx,
            &WsMessage::Connected {
                client_id: self.client_id.clone(),
            },
        );
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        info!(client_id = %self.client_id, "WebSocket disconnected");

        let dashboard = self.dashboard.clone();
        let client_id = self.client_id.clone();

        actix_rt::spawn(async move {
            let mut dashboard = dashboard.write().await;
            dashboard.remove_client(&client_id);
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                debug!(client_id = %self.client_id, message = %text);

                match serde_json::from_str::<WsMessage>(&text) {
                    Ok(WsMessage::Ping) => {
                        self.last_heartbeat = Instant::now();
                        Self::send(ctx, &WsMessage::Pong);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(client_id = %self.client_id, error = %e);
                        Self::send(
                            ctx,
                            &WsMessage::Error {
                                message: "Invalid message format".into(),
                            },
                        );
                    }
                }
            }
            Ok(ws::Message::Close(reason)) => {
                info!(client_id = %self.client_id, reason = ?reason);
                ctx.stop();
            }
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e);
                ctx.stop();
            }
            _ => {}
        }
    }
}
