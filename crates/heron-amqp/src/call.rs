//! Caller-facing call contract: what a request must expose and what a
//! handler looks like.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Serialize;

use heron_errors::Error;

/// A named, identified unit of work published to the broker.
///
/// `name` is the routing key / logical endpoint; `id` is the correlation
/// identifier and must be unique among currently outstanding calls — the
/// transport rejects a duplicate but cannot detect reuse across processes.
pub trait CallRequest: Serialize {
    fn name(&self) -> &str;
    fn id(&self) -> &str;
}

/// Boxed future returned by a call handler.
pub type HandlerFuture = BoxFuture<'static, Result<Bytes, Error>>;

/// Handler invoked for each inbound delivery of a subscription.
///
/// Returning `Err` emits an error event and produces no reply; returning
/// `Ok` with a non-empty body publishes that body back to the caller.
/// `Ok` with an empty body is a protocol violation (there is no
/// fire-and-forget mode).
pub type CallHandler = Arc<dyn Fn(Bytes) -> HandlerFuture + Send + Sync>;

pub(crate) fn validate_call(name: &str, id: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::private("call name is empty"));
    }
    if id.is_empty() {
        return Err(Error::private("call id is empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_call_accepts_non_empty_name_and_id() {
        assert!(validate_call("sign-in", "abc123").is_ok());
    }

    #[test]
    fn validate_call_rejects_empty_name() {
        let err = validate_call("", "abc123").unwrap_err();
        assert_eq!(err.private_message(), "call name is empty");
    }

    #[test]
    fn validate_call_rejects_empty_id() {
        let err = validate_call("sign-in", "").unwrap_err();
        assert_eq!(err.private_message(), "call id is empty");
    }
}
