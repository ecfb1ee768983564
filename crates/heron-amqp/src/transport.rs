//! Transport lifecycle: broker connection, administrative channel, reply
//! dispatching, and shutdown.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::StreamExt;
use lapin::options::BasicConsumeOptions;
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use heron_errors::Error;

use crate::config::AmqpConfig;
use crate::events::ErrorEvent;
use crate::gate::{ConnectionGate, InFlightTracker};
use crate::registry::CorrelationRegistry;
use crate::subscribe::Subscription;

pub(crate) const CONTENT_TYPE_JSON: &str = "application/json";

/// AMQP reply-success, used for graceful channel/connection close.
const CLOSE_REPLY_CODE: u16 = 200;

/// Call/response transport over a single AMQP connection.
///
/// Owned by the process for its lifetime: [`connect`](Self::connect) once at
/// startup, [`close`](Self::close) exactly once at shutdown. All publishers
/// share the administrative channel; each subscription gets a dedicated one.
impl std::fmt::Debug for AmqpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

pub struct AmqpTransport {
    pub(crate) config: AmqpConfig,
    pub(crate) connection: tokio::sync::Mutex<Connection>,
    admin: Mutex<Channel>,
    pub(crate) registry: Arc<CorrelationRegistry>,
    pub(crate) gate: ConnectionGate,
    pub(crate) in_flight: Arc<InFlightTracker>,
    pub(crate) subscriptions: Mutex<Vec<Subscription>>,
    events_tx: mpsc::UnboundedSender<ErrorEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ErrorEvent>>>,
    shutdown: watch::Sender<bool>,
    conn_errors: mpsc::UnboundedSender<String>,
    reply_consumer_tag: String,
}

impl AmqpTransport {
    /// Dials the broker, opens the administrative channel, registers the
    /// private reply consumer, and starts the reply dispatcher and the
    /// connection supervisor.
    ///
    /// Fails fast on dial, channel-open, or reply-consumer registration
    /// failure; the first dial is not retried. Reconnection after a
    /// successful start is handled by the supervisor.
    pub async fn connect(config: AmqpConfig) -> Result<Arc<Self>, Error> {
        let connection = dial(&config).await?;
        let admin = open_channel(&connection).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (conn_errors_tx, conn_errors_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        register_error_hook(&connection, conn_errors_tx.clone());

        let transport = Arc::new(Self {
            config,
            connection: tokio::sync::Mutex::new(connection),
            admin: Mutex::new(admin.clone()),
            registry: Arc::new(CorrelationRegistry::new()),
            gate: ConnectionGate::new(),
            in_flight: Arc::new(InFlightTracker::new()),
            subscriptions: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown,
            conn_errors: conn_errors_tx,
            reply_consumer_tag: Uuid::new_v4().to_string(),
        });

        transport.start_reply_dispatcher(&admin).await?;
        crate::supervisor::spawn(Arc::clone(&transport), conn_errors_rx);

        Ok(transport)
    }

    /// Closes the transport: stops the consumer loops, drains in-flight
    /// handlers (bounded by the configured drain timeout), then closes the
    /// administrative channel and the connection, returning the first error
    /// encountered.
    pub async fn close(&self) -> Result<(), Error> {
        info!("Closing AMQP transport");
        self.shutdown.send_replace(true);

        if !self.in_flight.wait_idle(self.config.drain_timeout).await {
            warn!(
                in_flight = self.in_flight.in_flight(),
                "Drain timeout elapsed with handlers still in flight"
            );
        }

        let channel_result = self
            .admin_channel()
            .close(CLOSE_REPLY_CODE, "shutting down")
            .await;
        let connection = self.connection.lock().await;
        let connection_result = connection.close(CLOSE_REPLY_CODE, "shutting down").await;

        channel_result.map_err(|e| Error::private(format!("failed to close channel: {e}")))?;
        connection_result
            .map_err(|e| Error::private(format!("failed to close connection: {e}")))?;
        Ok(())
    }

    /// Hands out the error-event receiver. Single-shot: returns `None` after
    /// the first call.
    pub fn take_error_events(&self) -> Option<mpsc::UnboundedReceiver<ErrorEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    pub(crate) fn admin_channel(&self) -> Channel {
        self.admin.lock().unwrap().clone()
    }

    pub(crate) fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn events_sender(&self) -> mpsc::UnboundedSender<ErrorEvent> {
        self.events_tx.clone()
    }

    pub(crate) fn emit(&self, event: ErrorEvent) {
        debug!(event = %event, "Transport error event");
        let _ = self.events_tx.send(event);
    }

    pub(crate) async fn subscription_channel(&self) -> Result<Channel, Error> {
        let connection = self.connection.lock().await;
        open_channel(&connection).await
    }

    /// Registers the reply consumer on `channel` and spawns the dispatch
    /// loop that routes each inbound reply to its correlation entry.
    pub(crate) async fn start_reply_dispatcher(&self, channel: &Channel) -> Result<(), Error> {
        // Replies are transient, so the reply queue is consumed with
        // auto-ack: losing one surfaces to the caller as a timeout. The
        // direct reply-to pseudo queue additionally requires no_ack.
        let consumer = channel
            .basic_consume(
                &self.config.reply_queue,
                &self.reply_consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::private(format!("failed to register reply consumer: {e}")))?;

        tokio::spawn(reply_dispatch_loop(
            consumer,
            Arc::clone(&self.registry),
            self.shutdown.subscribe(),
        ));
        Ok(())
    }

    /// Rebuilds the connection-scoped state after a connection loss: new
    /// connection, new administrative channel, fresh reply dispatcher, and
    /// every retained subscription re-established.
    pub(crate) async fn reestablish(&self) -> Result<(), Error> {
        let connection = dial(&self.config).await?;
        register_error_hook(&connection, self.conn_errors.clone());
        let admin = open_channel(&connection).await?;

        *self.connection.lock().await = connection;
        *self.admin.lock().unwrap() = admin.clone();
        self.start_reply_dispatcher(&admin).await?;

        let subscriptions: Vec<Subscription> = self.subscriptions.lock().unwrap().clone();
        for subscription in subscriptions {
            if let Err(error) = self.spawn_consumer(&subscription).await {
                warn!(call = %subscription.name, error = %error, "Failed to re-establish subscription");
                self.emit(ErrorEvent::ResubscribeFailed {
                    name: subscription.name.clone(),
                    error: error.to_string(),
                });
            }
        }
        Ok(())
    }
}

async fn dial(config: &AmqpConfig) -> Result<Connection, Error> {
    info!("Connecting to AMQP broker");
    let connection = Connection::connect(&config.uri, ConnectionProperties::default())
        .await
        .map_err(|e| Error::private(format!("failed to connect to AMQP broker: {e}")))?;
    info!("Connected to AMQP broker");
    Ok(connection)
}

async fn open_channel(connection: &Connection) -> Result<Channel, Error> {
    connection
        .create_channel()
        .await
        .map_err(|e| Error::private(format!("failed to open a channel: {e}")))
}

fn register_error_hook(connection: &Connection, notify: mpsc::UnboundedSender<String>) {
    connection.on_error(move |error| {
        let _ = notify.send(error.to_string());
    });
}

/// Routes inbound replies to their correlation entries until shutdown or
/// connection loss ends the consumer stream.
async fn reply_dispatch_loop(
    mut consumer: Consumer,
    registry: Arc<CorrelationRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Reply dispatcher started");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            delivery = consumer.next() => match delivery {
                Some(Ok(mut delivery)) => {
                    let Some(correlation_id) = delivery.properties.correlation_id().clone() else {
                        trace!("Reply without correlation id dropped");
                        continue;
                    };
                    let body = Bytes::from(std::mem::take(&mut delivery.data));
                    if !registry.resolve(correlation_id.as_str(), body) {
                        // No outstanding caller: timed out or cancelled.
                        trace!(correlation_id = %correlation_id.as_str(), "Reply with no outstanding call dropped");
                    }
                }
                Some(Err(error)) => {
                    warn!(error = %error, "Reply consumer error");
                    break;
                }
                None => break,
            },
        }
    }
    debug!("Reply dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_fails_fast_on_unreachable_broker() {
        let config = AmqpConfig::new("amqp://127.0.0.1:1/%2f").unwrap();
        let err = AmqpTransport::connect(config).await.unwrap_err();
        assert_eq!(err.kind(), heron_errors::ErrorKind::Private);
        assert!(err.private_message().contains("failed to connect"));
    }
}
