//! Inbound calls: queue declaration, consumer loops, handler execution.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Consumer};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use heron_errors::Error;

use crate::call::{CallHandler, HandlerFuture};
use crate::events::ErrorEvent;
use crate::gate::InFlightTracker;
use crate::headers::headers_with_trace_context;
use crate::transport::{AmqpTransport, CONTENT_TYPE_JSON};

/// Options for [`AmqpTransport::subscribe_on_call`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    parallel: usize,
    single_active_consumer: bool,
    exclusive: bool,
    no_wait: bool,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum handler executions in flight for this subscription.
    /// `0` and `1` both mean strictly sequential processing.
    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    /// Sets the `x-single-active-consumer` queue argument.
    pub fn with_single_active_consumer(mut self, single_active_consumer: bool) -> Self {
        self.single_active_consumer = single_active_consumer;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    fn workers(&self) -> usize {
        self.parallel.max(1)
    }
}

/// A registered `name → handler` binding, retained so the supervisor can
/// re-establish the subscription after a reconnect.
#[derive(Clone)]
pub(crate) struct Subscription {
    pub name: String,
    pub options: SubscribeOptions,
    pub handler: CallHandler,
}

impl AmqpTransport {
    /// Declares the `name` queue, opens a dedicated consumer, and processes
    /// deliveries until the transport closes.
    ///
    /// Each delivery invokes `handler` at most once and is acknowledged
    /// exactly once, even when the handler errors or panics. A non-empty
    /// `Ok` body is published back to the requester's reply address with
    /// the request's correlation id; handler errors and empty bodies emit
    /// [`ErrorEvent`]s instead.
    #[instrument(
        name = "amqp.subscribe_on_call",
        skip(self, handler, options),
        fields(call = %name)
    )]
    pub async fn subscribe_on_call<F, Fut>(
        &self,
        name: &str,
        handler: F,
        options: SubscribeOptions,
    ) -> Result<(), Error>
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Bytes, Error>> + Send + 'static,
    {
        if name.is_empty() {
            return Err(Error::private("call name is empty"));
        }

        self.gate.wait_open().await;

        let subscription = Subscription {
            name: name.to_string(),
            options,
            handler: Arc::new(move |body| -> HandlerFuture { Box::pin(handler(body)) }),
        };
        self.spawn_consumer(&subscription).await?;
        self.subscriptions.lock().unwrap().push(subscription);
        info!("Subscription established");
        Ok(())
    }

    /// Declares the queue and starts the consumer loop for `subscription`. Also
    /// used by the supervisor when re-establishing subscriptions.
    pub(crate) async fn spawn_consumer(&self, subscription: &Subscription) -> Result<(), Error> {
        let channel = self.subscription_channel().await?;

        let mut queue_args = FieldTable::default();
        if subscription.options.single_active_consumer {
            queue_args.insert("x-single-active-consumer".into(), AMQPValue::Boolean(true));
        }
        channel
            .queue_declare(
                &subscription.name,
                QueueDeclareOptions {
                    durable: false,
                    auto_delete: true,
                    exclusive: subscription.options.exclusive,
                    nowait: subscription.options.no_wait,
                    ..Default::default()
                },
                queue_args,
            )
            .await
            .map_err(|e| Error::private(format!("failed to create queue {}: {e}", subscription.name)))?;

        let consumer_tag = Uuid::new_v4().to_string();
        let consumer = channel
            .basic_consume(
                &subscription.name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                Error::private(format!(
                    "failed to register consumer on {}: {e}",
                    subscription.name
                ))
            })?;

        let consumer_loop = ConsumerLoop {
            name: subscription.name.clone(),
            channel,
            handler: Arc::clone(&subscription.handler),
            permits: Arc::new(Semaphore::new(subscription.options.workers())),
            events: self.events_sender(),
            in_flight: Arc::clone(&self.in_flight),
            shutdown: self.shutdown_receiver(),
        };
        tokio::spawn(consumer_loop.run(consumer));
        Ok(())
    }
}

struct ConsumerLoop {
    name: String,
    channel: Channel,
    handler: CallHandler,
    permits: Arc<Semaphore>,
    events: mpsc::UnboundedSender<ErrorEvent>,
    in_flight: Arc<InFlightTracker>,
    shutdown: watch::Receiver<bool>,
}

impl ConsumerLoop {
    async fn run(mut self, mut consumer: Consumer) {
        debug!(call = %self.name, "Consumer loop started");
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                delivery = consumer.next() => match delivery {
                    Some(Ok(delivery)) => self.dispatch(delivery).await,
                    Some(Err(error)) => {
                        warn!(call = %self.name, error = %error, "Consumer error");
                        let _ = self.events.send(ErrorEvent::ConsumerFailed {
                            name: self.name.clone(),
                            error: error.to_string(),
                        });
                        // Channel-level failure; the supervisor re-establishes
                        // the subscription after reconnecting.
                        break;
                    }
                    None => break,
                },
            }
        }
        debug!(call = %self.name, "Consumer loop stopped");
    }

    /// Hands one delivery to a worker task, bounded by the subscription's
    /// parallelism.
    async fn dispatch(&self, delivery: Delivery) {
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            // The semaphore is never closed while the loop runs.
            Err(_) => return,
        };
        let work = self.in_flight.begin();

        let name = self.name.clone();
        let channel = self.channel.clone();
        let handler = Arc::clone(&self.handler);
        let events = self.events.clone();
        tokio::spawn(async move {
            handle_delivery(name, channel, handler, events, delivery).await;
            drop(work);
            drop(permit);
        });
    }
}

async fn handle_delivery(
    name: String,
    channel: Channel,
    handler: CallHandler,
    events: mpsc::UnboundedSender<ErrorEvent>,
    mut delivery: Delivery,
) {
    let correlation_id = delivery
        .properties
        .correlation_id()
        .clone()
        .map(|id| id.as_str().to_string())
        .unwrap_or_default();
    let reply_to = delivery
        .properties
        .reply_to()
        .clone()
        .map(|addr| addr.as_str().to_string());
    let body = Bytes::from(std::mem::take(&mut delivery.data));

    // The handler runs in its own task so a panic is contained to this
    // delivery and surfaces as a JoinError.
    let outcome = tokio::spawn(handler(body)).await;

    match outcome {
        Ok(Ok(response)) if !response.is_empty() => match reply_to {
            Some(reply_to) => {
                publish_reply(&channel, &name, &correlation_id, &reply_to, &response, &events)
                    .await;
            }
            None => {
                let _ = events.send(ErrorEvent::MissingReplyAddress {
                    name: name.clone(),
                    correlation_id: correlation_id.clone(),
                });
            }
        },
        Ok(Ok(_)) => {
            let _ = events.send(ErrorEvent::EmptyResponse {
                name: name.clone(),
                correlation_id: correlation_id.clone(),
            });
        }
        Ok(Err(error)) => {
            let _ = events.send(ErrorEvent::HandlerFailed {
                name: name.clone(),
                correlation_id: correlation_id.clone(),
                error,
            });
        }
        Err(join_error) => {
            warn!(call = %name, correlation_id = %correlation_id, "Handler panicked");
            let _ = events.send(ErrorEvent::HandlerPanicked {
                name: name.clone(),
                correlation_id: correlation_id.clone(),
                message: panic_message(join_error),
            });
        }
    }

    // Every delivery is acknowledged exactly once, whatever the handler did.
    if let Err(error) = delivery.ack(BasicAckOptions::default()).await {
        let _ = events.send(ErrorEvent::AckFailed {
            name,
            correlation_id,
            error: error.to_string(),
        });
    }
}

async fn publish_reply(
    channel: &Channel,
    name: &str,
    correlation_id: &str,
    reply_to: &str,
    response: &Bytes,
    events: &mpsc::UnboundedSender<ErrorEvent>,
) {
    let properties = BasicProperties::default()
        .with_content_type(CONTENT_TYPE_JSON.into())
        .with_correlation_id(correlation_id.into())
        .with_headers(headers_with_trace_context());

    // Replies address the caller's reply queue directly, which routes
    // through the default exchange.
    match channel
        .basic_publish(
            "",
            reply_to,
            BasicPublishOptions::default(),
            response,
            properties,
        )
        .await
    {
        Ok(_confirm) => {}
        Err(error) => {
            let _ = events.send(ErrorEvent::ReplyPublishFailed {
                name: name.to_string(),
                correlation_id: correlation_id.to_string(),
                error: error.to_string(),
            });
        }
    }
}

fn panic_message(join_error: tokio::task::JoinError) -> String {
    if join_error.is_panic() {
        let payload = join_error.into_panic();
        if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "opaque panic payload".to_string()
        }
    } else {
        join_error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_to_sequential_processing() {
        let options = SubscribeOptions::new();
        assert_eq!(options.workers(), 1);
        assert!(!options.single_active_consumer);
        assert!(!options.exclusive);
        assert!(!options.no_wait);
    }

    #[test]
    fn parallel_zero_still_means_one_worker() {
        assert_eq!(SubscribeOptions::new().with_parallel(0).workers(), 1);
    }

    #[test]
    fn parallel_hint_sets_worker_count() {
        assert_eq!(SubscribeOptions::new().with_parallel(8).workers(), 8);
    }

    #[test]
    fn builders_set_queue_flags() {
        let options = SubscribeOptions::new()
            .with_single_active_consumer(true)
            .with_exclusive(true)
            .with_no_wait(true);
        assert!(options.single_active_consumer);
        assert!(options.exclusive);
        assert!(options.no_wait);
    }

    #[tokio::test]
    async fn panic_message_extracts_str_payload() {
        let join_error = tokio::spawn(async { panic!("boom") }).await.unwrap_err();
        assert_eq!(panic_message(join_error), "boom");
    }

    #[tokio::test]
    async fn panic_message_extracts_formatted_payload() {
        let join_error = tokio::spawn(async { panic!("bad value: {}", 42) })
            .await
            .unwrap_err();
        assert_eq!(panic_message(join_error), "bad value: 42");
    }
}
