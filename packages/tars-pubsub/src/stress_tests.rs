//! Stress tests for the registration and dispatch paths.
//!
//! These race registrations, teardowns, publishes and shutdown against each
//! other on a multi-threaded runtime.

#[cfg(test)]
mod stress_tests {
    use crate::codec::JSON;
    use crate::context::Context;
    use crate::engine::Engine;
    use crate::error::PubSubError;
    use crate::handler::{handler_fn, Methods};
    use crate::memory::MemoryBroker;
    use crate::publisher::PublishOptions;
    use crate::subscriber::SubscriberOptions;
    use crate::testing::RecordingBroker;
    use futures::future::join_all;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    // ==========================================================================
    // Test Types
    // ==========================================================================

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Tick {
        n: usize,
    }

    async fn recording_engine() -> (Arc<Engine>, Arc<RecordingBroker>) {
        let broker = Arc::new(RecordingBroker::new());
        let engine = Engine::builder(broker.clone()).build();
        engine.start().await.unwrap();
        (Arc::new(engine), broker)
    }

    // ==========================================================================
    // Registration
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registration_has_one_winner() {
        let (engine, broker) = recording_engine().await;

        let tasks = (0..32).map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .register_subscriber(
                        "orders",
                        handler_fn(|_: Tick| async { Ok(()) }),
                        SubscriberOptions::default(),
                    )
                    .await
            })
        });
        let results: Vec<_> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, PubSubError::AlreadyExists { .. })));
        assert_eq!(broker.subscriptions(), vec!["orders".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distinct_topics_register_in_parallel() {
        let (engine, broker) = recording_engine().await;

        let tasks = (0..50).map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .register_subscriber(
                        &format!("topic.{i:02}"),
                        handler_fn(|_: Tick| async { Ok(()) }),
                        SubscriberOptions::default(),
                    )
                    .await
            })
        });
        for joined in join_all(tasks).await {
            joined.unwrap().unwrap();
        }

        let topics = engine.topics();
        assert_eq!(topics.len(), 50);
        assert_eq!(topics[0], "topic.00");
        assert_eq!(topics[49], "topic.49");
        assert_eq!(broker.subscriptions().len(), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_register_unsubscribe_churn() {
        let (engine, broker) = recording_engine().await;
        let registered = Arc::new(AtomicUsize::new(0));

        let tasks = (0..8).map(|_| {
            let engine = engine.clone();
            let registered = registered.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    let result = engine
                        .register_subscriber(
                            "churn",
                            handler_fn(|_: Tick| async { Ok(()) }),
                            SubscriberOptions::default(),
                        )
                        .await;
                    match result {
                        Ok(()) => {
                            registered.fetch_add(1, Ordering::SeqCst);
                            engine.unsubscribe("churn").await.unwrap();
                        }
                        Err(PubSubError::AlreadyExists { .. }) => tokio::task::yield_now().await,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            })
        });
        for joined in join_all(tasks).await {
            joined.unwrap();
        }

        assert!(!engine.is_subscribed("churn"));
        assert!(broker.subscriptions().is_empty());
        assert!(registered.load(Ordering::SeqCst) > 0);
        assert_eq!(
            broker.unsubscribed().len(),
            registered.load(Ordering::SeqCst)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_racing_registrations_leaks_nothing() {
        let (engine, broker) = recording_engine().await;

        let tasks: Vec<_> = (0..40)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .register_subscriber(
                            &format!("race.{i}"),
                            handler_fn(|_: Tick| async { Ok(()) }),
                            SubscriberOptions::default(),
                        )
                        .await
                })
            })
            .collect();

        engine.shutdown().await.unwrap();

        for joined in join_all(tasks).await {
            match joined.unwrap() {
                Ok(()) | Err(PubSubError::ShuttingDown { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert!(engine.topics().is_empty());
        assert!(broker.subscriptions().is_empty());
    }

    // ==========================================================================
    // Dispatch
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_publish_with_failing_handler() {
        let broker = Arc::new(MemoryBroker::new());
        let engine = Arc::new(Engine::builder(broker.clone()).build());
        engine.start().await.unwrap();

        let ok_calls = Arc::new(AtomicUsize::new(0));
        let counter = ok_calls.clone();
        engine
            .register_subscriber(
                "ticks",
                Methods::new("Ticker")
                    .method("count", move |_: Tick| {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    })
                    .method("reject", |tick: Tick| async move {
                        Err(anyhow::anyhow!("rejected tick {}", tick.n))
                    }),
                SubscriberOptions::default(),
            )
            .await
            .unwrap();

        let tasks = (0..100).map(|n| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .publish(
                        &Context::background(),
                        "ticks",
                        &Tick { n },
                        PublishOptions::default().with_content_type(JSON),
                    )
                    .await
            })
        });
        for joined in join_all(tasks).await {
            joined.unwrap().unwrap();
        }

        assert_eq!(ok_calls.load(Ordering::SeqCst), 100);
        let failed = broker.failed_deliveries();
        assert_eq!(failed.len(), 100);
        assert!(failed
            .iter()
            .all(|f| f.error.starts_with("subscriber error: rejected tick")));
        assert_eq!(engine.inflight().count(), 0);
        assert_eq!(broker.acked_count(), 0);
    }
}
