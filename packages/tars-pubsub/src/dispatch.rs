//! Per-subscription dispatch adapter.
//!
//! The broker invokes a [`DispatchAdapter`] once per inbound event. The adapter
//! turns the envelope into typed payloads, runs every bound handler as its own
//! task, and folds their outcomes into one result for the broker's ack/nack
//! decision.
//!
//! # Per-event flow
//!
//! ```text
//! Event ──► copy header ──► content-type (or default) ──► codec
//!                                                           │
//!            ┌──────────── decode one payload per handler ◄─┘
//!            ▼
//!   spawn handler tasks (context, payload) ──► join all ──► aggregate errors
//! ```
//!
//! All payloads are decoded before the first task is spawned, so a decode
//! failure leaves the event entirely unprocessed.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::broker::{Event, EventHandler};
use crate::codec::{Buffer, CodecRegistry, Message, MessageKind, Payload};
use crate::context::Context;
use crate::envelope::CONTENT_TYPE;
use crate::error::PubSubError;
use crate::handler::HandlerFuture;
use crate::inflight::InflightTracker;
use crate::subscriber::Subscriber;

/// A handler invocation as seen by subscriber wrappers.
pub type SubscriberFunc = Arc<dyn Fn(Context, Box<dyn Payload>) -> HandlerFuture + Send + Sync>;

/// Middleware around every handler invocation.
///
/// Wrappers registered first run outermost.
///
/// # Example
///
/// ```ignore
/// let timing: SubscriberWrapper = Arc::new(|next: SubscriberFunc| {
///     Arc::new(move |ctx, payload| {
///         let next = next.clone();
///         async move {
///             let started = Instant::now();
///             let result = next(ctx, payload).await;
///             debug!(elapsed = ?started.elapsed(), "handler finished");
///             result
///         }
///         .boxed()
///     })
/// });
/// ```
pub type SubscriberWrapper = Arc<dyn Fn(SubscriberFunc) -> SubscriberFunc + Send + Sync>;

/// Dispatches inbound events to one subscriber's handlers.
pub struct DispatchAdapter {
    subscriber: Arc<Subscriber>,
    codecs: Arc<CodecRegistry>,
    default_content_type: Arc<str>,
    inflight: Arc<InflightTracker>,
    funcs: Vec<SubscriberFunc>,
}

impl DispatchAdapter {
    pub fn new(
        subscriber: Arc<Subscriber>,
        codecs: Arc<CodecRegistry>,
        default_content_type: impl Into<Arc<str>>,
        inflight: Arc<InflightTracker>,
        wrappers: &[SubscriberWrapper],
    ) -> Self {
        let funcs = subscriber
            .handlers()
            .iter()
            .map(|handler| {
                let handler = handler.clone();
                let mut func: SubscriberFunc =
                    Arc::new(move |ctx: Context, payload: Box<dyn Payload>| handler.call(ctx, payload));
                for wrapper in wrappers.iter().rev() {
                    func = wrapper(func);
                }
                func
            })
            .collect();

        Self {
            subscriber,
            codecs,
            default_content_type: default_content_type.into(),
            inflight,
            funcs,
        }
    }

    pub fn topic(&self) -> &str {
        self.subscriber.topic()
    }

    /// Handle one inbound event.
    ///
    /// Returns once every handler task has finished. At most one error is
    /// returned per event, however many handlers failed.
    pub async fn dispatch(&self, event: &dyn Event) -> Result<(), PubSubError> {
        let topic = self.subscriber.topic();
        let envelope = event.message();

        // The inbound envelope is shared with the broker; work on a copy.
        let mut header = envelope.header.clone();
        let content_type = match header.content_type().map(str::to_string) {
            Some(ct) => ct,
            None => {
                header.insert(CONTENT_TYPE, &*self.default_content_type);
                self.default_content_type.to_string()
            }
        };

        let new_codec = self.codecs.get(&content_type).map_err(|e| {
            warn!(topic = %topic, content_type = %content_type, "no codec for inbound event");
            PubSubError::Decode {
                content_type: content_type.clone(),
                reason: e.to_string(),
            }
        })?;

        let mut message = Message::event();
        message.id = header.message_id();
        message.target = event.topic().to_string();
        message.header = header.clone();

        let handlers = self.subscriber.handlers();
        let mut payloads = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let mut payload = handler.new_payload();
            let mut buf = Buffer::from_slice(&envelope.body);
            let decoded = {
                let mut codec = new_codec(&mut buf);
                let mut message = message.clone();
                codec
                    .read_header(&mut message, MessageKind::Event)
                    .and_then(|()| codec.read_body(&mut *payload))
                    .and_then(|()| codec.close())
            };
            if let Err(e) = decoded {
                warn!(
                    topic = %topic,
                    handler = %handler.name(),
                    content_type = %content_type,
                    error = %e,
                    "failed to decode event"
                );
                return Err(PubSubError::Decode {
                    content_type,
                    reason: format!("{}: {e}", handler.name()),
                });
            }
            payloads.push(payload);
        }

        let ctx = self
            .subscriber
            .options()
            .context
            .for_event(header, &self.inflight);

        let mut names = Vec::with_capacity(handlers.len());
        let mut tasks = Vec::with_capacity(handlers.len());
        for ((handler, func), payload) in handlers.iter().zip(&self.funcs).zip(payloads) {
            let name = handler.name().to_string();
            let guard = self.inflight.begin(topic);
            let func = func.clone();
            let ctx = ctx.clone();
            let task_topic = topic.to_string();
            let task_name = name.clone();

            tasks.push(tokio::spawn(async move {
                let _guard = guard;
                let result = AssertUnwindSafe(async move { func(ctx, payload).await })
                    .catch_unwind()
                    .await;

                match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(format!("{e:#}")),
                    Err(panic_info) => {
                        let panic_msg = extract_panic_message(&panic_info);
                        error!(
                            topic = %task_topic,
                            handler = %task_name,
                            panic = %panic_msg,
                            "handler panicked"
                        );
                        Err(format!("handler {task_name} panicked: {panic_msg}"))
                    }
                }
            }));
            names.push(name);
        }

        let errors: Vec<String> = join_all(tasks)
            .await
            .into_iter()
            .zip(names)
            .filter_map(|(joined, name)| match joined {
                Ok(outcome) => outcome.err(),
                Err(e) => Some(format!("handler {name} did not complete: {e}")),
            })
            .collect();

        if errors.is_empty() {
            debug!(topic = %topic, handlers = handlers.len(), "event dispatched");
            return Ok(());
        }

        warn!(
            topic = %topic,
            failed = errors.len(),
            handlers = handlers.len(),
            "subscriber error"
        );
        Err(PubSubError::HandlerFailed {
            topic: topic.to_string(),
            errors,
        })
    }

    /// Wrap this adapter as a broker callback.
    pub fn into_event_handler(self: Arc<Self>) -> EventHandler {
        Arc::new(
            move |event: Arc<dyn Event>| -> BoxFuture<'static, Result<(), PubSubError>> {
                let adapter = self.clone();
                async move { adapter.dispatch(event.as_ref()).await }.boxed()
            },
        )
    }
}

impl std::fmt::Debug for DispatchAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchAdapter")
            .field("topic", &self.topic())
            .field("handlers", &self.funcs.len())
            .field("default_content_type", &self.default_content_type)
            .finish_non_exhaustive()
    }
}

fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Delivery;
    use crate::codec::{DEFAULT_CONTENT_TYPE, JSON};
    use crate::envelope::{Envelope, Header, TOPIC};
    use crate::handler::{handler_fn, IntoHandlers, Methods};
    use crate::subscriber::SubscriberOptions;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct OrderEvent {
        id: String,
    }

    fn adapter(
        handlers: impl IntoHandlers,
        wrappers: &[SubscriberWrapper],
    ) -> (DispatchAdapter, Arc<InflightTracker>) {
        let subscriber =
            Subscriber::new("orders.created", handlers, SubscriberOptions::default()).unwrap();
        let inflight = Arc::new(InflightTracker::new());
        let adapter = DispatchAdapter::new(
            Arc::new(subscriber),
            Arc::new(CodecRegistry::default()),
            DEFAULT_CONTENT_TYPE,
            inflight.clone(),
            wrappers,
        );
        (adapter, inflight)
    }

    fn json_event(body: &'static str) -> Delivery {
        let header = Header::new()
            .with(CONTENT_TYPE, JSON)
            .with(TOPIC, "orders.created");
        Delivery::new("orders.created", Envelope::new(header, body.as_bytes()))
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[tokio::test]
    async fn test_orders_created_scenario() {
        let calls = counter();
        let seen = calls.clone();
        let (adapter, inflight) = adapter(
            handler_fn(move |ctx: Context, order: OrderEvent| {
                let seen = seen.clone();
                async move {
                    anyhow::ensure!(order.id == "42", "unexpected id {}", order.id);
                    anyhow::ensure!(ctx.topic() == Some("orders.created"), "missing topic");
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            &[],
        );

        adapter.dispatch(&json_event(r#"{"id":"42"}"#)).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(inflight.count(), 0);
    }

    #[tokio::test]
    async fn test_missing_content_type_uses_default() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let (adapter, _) = adapter(
            handler_fn(move |ctx: Context, raw: Vec<u8>| {
                let sink = sink.clone();
                async move {
                    anyhow::ensure!(ctx.get(CONTENT_TYPE) == Some(DEFAULT_CONTENT_TYPE));
                    sink.lock().unwrap().push(raw);
                    Ok(())
                }
            }),
            &[],
        );

        let event = Delivery::new("orders.created", Envelope::new(Header::new(), &b"\x01\x02"[..]));
        adapter.dispatch(&event).await.unwrap();

        assert_eq!(*received.lock().unwrap(), vec![vec![1_u8, 2]]);
        // The inbound envelope is never mutated.
        assert!(event.message().header.get(CONTENT_TYPE).is_none());
    }

    #[tokio::test]
    async fn test_unknown_content_type_invokes_nothing() {
        let calls = counter();
        let seen = calls.clone();
        let (adapter, _) = adapter(
            handler_fn(move |_: Vec<u8>| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }),
            &[],
        );

        let header = Header::new().with(CONTENT_TYPE, "application/x-yaml");
        let event = Delivery::new("orders.created", Envelope::new(header, &b"a: 1"[..]));
        let err = adapter.dispatch(&event).await.unwrap_err();

        assert!(matches!(err, PubSubError::Decode { .. }));
        assert!(err.to_string().contains("Unsupported Content-Type: application/x-yaml"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_decode_failure_leaves_event_unprocessed() {
        let calls = counter();
        let (a, b) = (calls.clone(), calls.clone());
        let (adapter, _) = adapter(
            Methods::new("Orders")
                .method("typed", move |_: OrderEvent| {
                    a.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                })
                .method("count", move |_: u64| {
                    b.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                }),
            &[],
        );

        let err = adapter
            .dispatch(&json_event(r#"{"id":"42"}"#))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Orders.count"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_one_failing_handler_yields_one_aggregate_error() {
        let calls = counter();
        let (a, c) = (calls.clone(), calls.clone());
        let (adapter, _) = adapter(
            Methods::new("Orders")
                .method("first", move |_: OrderEvent| {
                    a.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                })
                .method("broken", |order: OrderEvent| async move {
                    Err(anyhow::anyhow!("cannot ship order {}", order.id))
                })
                .method("third", move |_: OrderEvent| {
                    c.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                }),
            &[],
        );

        let err = adapter
            .dispatch(&json_event(r#"{"id":"42"}"#))
            .await
            .unwrap_err();

        match &err {
            PubSubError::HandlerFailed { topic, errors } => {
                assert_eq!(topic, "orders.created");
                assert_eq!(errors, &vec!["cannot ship order 42".to_string()]);
            }
            other => panic!("Expected HandlerFailed, got {other:?}"),
        }
        assert_eq!(err.to_string(), "subscriber error: cannot ship order 42");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_reported() {
        let (adapter, inflight) = adapter(
            Methods::new("Orders")
                .method("fine", |_: OrderEvent| async { Ok(()) })
                .method("explodes", |_: OrderEvent| async {
                    if true {
                        panic!("boom");
                    }
                    Ok(())
                }),
            &[],
        );

        let err = adapter
            .dispatch(&json_event(r#"{"id":"42"}"#))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("handler Orders.explodes panicked: boom"));
        assert_eq!(inflight.count(), 0);
    }

    #[tokio::test]
    async fn test_wrappers_apply_first_outermost() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let wrapper = |label: &'static str, order: Arc<Mutex<Vec<&'static str>>>| -> SubscriberWrapper {
            Arc::new(move |next: SubscriberFunc| -> SubscriberFunc {
                let order = order.clone();
                Arc::new(move |ctx: Context, payload: Box<dyn Payload>| -> HandlerFuture {
                    order.lock().unwrap().push(label);
                    next(ctx, payload)
                })
            })
        };
        let wrappers = [wrapper("outer", order.clone()), wrapper("inner", order.clone())];

        let sink = order.clone();
        let (adapter, _) = adapter(
            handler_fn(move |_: OrderEvent| {
                sink.lock().unwrap().push("handler");
                async { Ok(()) }
            }),
            &wrappers,
        );

        adapter.dispatch(&json_event(r#"{"id":"1"}"#)).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["outer", "inner", "handler"]);
    }

    #[tokio::test]
    async fn test_event_handler_drives_dispatch() {
        let calls = counter();
        let seen = calls.clone();
        let (adapter, _) = adapter(
            handler_fn(move |_: OrderEvent| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }),
            &[],
        );

        let callback = Arc::new(adapter).into_event_handler();
        let event: Arc<dyn Event> = Arc::new(json_event(r#"{"id":"7"}"#));
        callback(event).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscriber_timeout_restarts_per_event() {
        let options = SubscriberOptions::default()
            .with_context(Context::background().with_timeout(Duration::from_millis(10)));
        let subscriber = Subscriber::new(
            "orders.created",
            handler_fn(|ctx: Context, _: OrderEvent| async move {
                anyhow::ensure!(ctx.deadline().is_some(), "event context has no deadline");
                anyhow::ensure!(!ctx.is_expired(), "event context already expired");
                Ok(())
            }),
            options,
        )
        .unwrap();
        let adapter = DispatchAdapter::new(
            Arc::new(subscriber),
            Arc::new(CodecRegistry::default()),
            DEFAULT_CONTENT_TYPE,
            Arc::new(InflightTracker::new()),
            &[],
        );

        // Well past the deadline of the base context.
        tokio::time::sleep(Duration::from_millis(30)).await;

        adapter.dispatch(&json_event(r#"{"id":"1"}"#)).await.unwrap();
        adapter.dispatch(&json_event(r#"{"id":"2"}"#)).await.unwrap();
    }
}
