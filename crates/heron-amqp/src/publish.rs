//! Outbound calls.

use std::time::Duration;

use bytes::Bytes;
use lapin::options::BasicPublishOptions;
use lapin::BasicProperties;
use tracing::{debug, instrument};

use heron_errors::Error;

use crate::call::{validate_call, CallRequest};
use crate::config::AmqpConfig;
use crate::headers::headers_with_trace_context;
use crate::transport::{AmqpTransport, CONTENT_TYPE_JSON};

/// Options for [`AmqpTransport::publish_call`]. Unset fields fall back to
/// the transport configuration.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    mandatory: Option<bool>,
    immediate: Option<bool>,
    timeout: Option<Duration>,
    reply_to: Option<String>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = Some(mandatory);
        self
    }

    pub fn with_immediate(mut self, immediate: bool) -> Self {
        self.immediate = Some(immediate);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    fn resolve(self, config: &AmqpConfig) -> ResolvedCallOptions {
        ResolvedCallOptions {
            mandatory: self.mandatory.unwrap_or(config.mandatory),
            immediate: self.immediate.unwrap_or(config.immediate),
            timeout: self.timeout.unwrap_or(config.call_timeout),
            reply_to: self.reply_to.unwrap_or_else(|| config.reply_queue.clone()),
        }
    }
}

struct ResolvedCallOptions {
    mandatory: bool,
    immediate: bool,
    timeout: Duration,
    reply_to: String,
}

impl AmqpTransport {
    /// Publishes `request` and waits for the matching reply.
    ///
    /// The request is serialized as JSON and published to the configured
    /// exchange with the call name as routing key, the call id as
    /// correlation id, and the transport's private reply address. Returns
    /// the reply payload, a Timeout error when no reply arrives within the
    /// window, or a Private error for contract violations and broker
    /// failures.
    ///
    /// Dropping the returned future cancels the wait and releases the
    /// correlation id; broker-side processing of the request is unaffected.
    #[instrument(
        name = "amqp.publish_call",
        skip(self, request, options),
        fields(call = %request.name(), correlation_id = %request.id())
    )]
    pub async fn publish_call<R: CallRequest>(
        &self,
        request: &R,
        options: CallOptions,
    ) -> Result<Bytes, Error> {
        let name = request.name().to_string();
        let id = request.id().to_string();
        validate_call(&name, &id)?;

        self.gate.wait_open().await;

        let body = serde_json::to_vec(request)
            .map_err(|e| Error::private(format!("failed to serialize call request: {e}")))?;
        let options = options.resolve(&self.config);

        let (reply, _pending) = self.registry.register(&id)?;

        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE_JSON.into())
            .with_correlation_id(id.as_str().into())
            .with_reply_to(options.reply_to.as_str().into())
            .with_headers(headers_with_trace_context());

        let _confirm = self
            .admin_channel()
            .basic_publish(
                &self.config.exchange,
                &name,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    immediate: options.immediate,
                },
                &body,
                properties,
            )
            .await
            .map_err(|e| Error::private(format!("failed to publish call to {name}: {e}")))?;

        debug!(
            timeout_ms = options.timeout.as_millis() as u64,
            "Call published, awaiting reply"
        );

        match tokio::time::timeout(options.timeout, reply).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(Error::private(format!(
                "reply slot closed on {name} ({id})"
            ))),
            Err(_) => Err(Error::timeout(format!("timeout on {name} ({id})"))),
        }
    }
}
