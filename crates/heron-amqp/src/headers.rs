//! OpenTelemetry trace-context propagation into AMQP message headers.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use opentelemetry::propagation::Injector;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

struct HeaderTableCarrier<'a>(&'a mut FieldTable);

impl Injector for HeaderTableCarrier<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(
            ShortString::from(key),
            AMQPValue::LongString(LongString::from(value)),
        );
    }
}

pub fn inject_trace_context(headers: &mut FieldTable) {
    let cx = Span::current().context();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&cx, &mut HeaderTableCarrier(headers));
    });
}

pub fn headers_with_trace_context() -> FieldTable {
    let mut headers = FieldTable::default();
    inject_trace_context(&mut headers);
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_with_trace_context_creates_table() {
        let headers = headers_with_trace_context();
        let _ = headers.inner().len();
    }

    #[test]
    fn inject_trace_context_does_not_panic() {
        let mut headers = FieldTable::default();
        inject_trace_context(&mut headers);
    }

    #[test]
    fn carrier_inserts_long_string_values() {
        let mut headers = FieldTable::default();
        HeaderTableCarrier(&mut headers).set("traceparent", "00-abc-def-01".to_string());
        match headers.inner().get(&ShortString::from("traceparent")) {
            Some(AMQPValue::LongString(value)) => {
                assert_eq!(value.as_bytes(), b"00-abc-def-01");
            }
            other => panic!("expected LongString header, got {:?}", other),
        }
    }
}
