/// Transaction tests
///
/// with_transaction against the in-memory store: commit, retry on transient
/// failures, commit retry, fatal propagation and rollback.
/// Run with: cargo test --test transaction_tests

use doctxn::{
    Client, ClientConfig, ClientSession, Collection, DbError, ErrorLabel, FailCommand,
    FailPoint, FailPointError, ReadConcern, TransactionOptions, TransactionRetryPolicy,
    TransactionState, WriteConcern,
};
use futures::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn fast_policy() -> TransactionRetryPolicy {
    TransactionRetryPolicy::new().backoff_ms(1, 5)
}

fn restaurant_client(policy: TransactionRetryPolicy) -> (Client, Collection) {
    let config = ClientConfig::new()
        .database("sample_restaurants")
        .write_concern(WriteConcern::majority())
        .read_concern(ReadConcern::Local)
        .retry_policy(policy);
    let client = Client::with_config(config).unwrap();
    let restaurants = client.default_database().collection("restaurants");
    (client, restaurants)
}

/// Inserts the two sample restaurants and counts how often it ran.
async fn insert_two_restaurants(
    client: &Client,
    restaurants: &Collection,
    attempts: &Arc<AtomicUsize>,
) -> doctxn::Result<()> {
    let session = client.start_session().await?;
    insert_two_restaurants_with(&session, restaurants, attempts).await
}

async fn insert_two_restaurants_with(
    session: &ClientSession,
    restaurants: &Collection,
    attempts: &Arc<AtomicUsize>,
) -> doctxn::Result<()> {
    session
        .with_transaction(|session| {
            let restaurants = restaurants.clone();
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                restaurants
                    .insert_one_with_session(json!({"name": "PyMongo Pizza", "cuisine": "Pizza"}), &session)
                    .await?;
                restaurants
                    .insert_one_with_session(json!({"name": "PyMongo Burger", "cuisine": "Burger"}), &session)
                    .await?;
                Ok(())
            }
        })
        .await
}

async fn restaurant_names(restaurants: &Collection) -> Vec<String> {
    let mut names: Vec<String> = restaurants
        .find(json!({}))
        .await
        .unwrap()
        .into_iter()
        .filter_map(|doc| doc.get("name").and_then(|v| v.as_str()).map(str::to_string))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_both_restaurants_committed_together() {
    let (client, restaurants) = restaurant_client(fast_policy());
    let attempts = Arc::new(AtomicUsize::new(0));

    insert_two_restaurants(&client, &restaurants, &attempts).await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(
        restaurant_names(&restaurants).await,
        vec!["PyMongo Burger", "PyMongo Pizza"]
    );

    let stats = client.stats().await;
    assert_eq!(stats.transactions_started, 1);
    assert_eq!(stats.transactions_committed, 1);
    assert_eq!(stats.transactions_aborted, 0);
}

#[tokio::test]
async fn test_with_transaction_returns_callback_value() {
    let (client, restaurants) = restaurant_client(fast_policy());
    let session = client.start_session().await.unwrap();

    let inserted = session
        .with_transaction(|session| {
            let restaurants = restaurants.clone();
            async move {
                let result = restaurants
                    .insert_one_with_session(json!({"_id": "pizza", "name": "PyMongo Pizza"}), &session)
                    .await?;
                Ok(result.inserted_id)
            }
        })
        .await
        .unwrap();

    assert_eq!(inserted, json!("pizza"));
    assert_eq!(session.transaction_state().await, TransactionState::Committed);
}

#[tokio::test]
async fn test_transient_insert_failure_is_retried() {
    let (client, restaurants) = restaurant_client(fast_policy());
    client
        .fail_points()
        .configure(FailPoint::new(FailCommand::Insert, FailPointError::Network).times(2));
    let attempts = Arc::new(AtomicUsize::new(0));

    insert_two_restaurants(&client, &restaurants, &attempts).await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(restaurants.count_documents(json!({})).await.unwrap(), 2);

    let stats = client.stats().await;
    assert_eq!(stats.transactions_started, 3);
    assert_eq!(stats.transactions_aborted, 2);
    assert_eq!(stats.transactions_committed, 1);
}

#[tokio::test]
async fn test_transient_failure_on_second_write_rolls_back_first() {
    let (client, restaurants) = restaurant_client(fast_policy());
    let session = client.start_session().await.unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));

    session
        .with_transaction(|session| {
            let restaurants = restaurants.clone();
            let attempts = attempts.clone();
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                restaurants
                    .insert_one_with_session(json!({"_id": "pizza", "name": "PyMongo Pizza"}), &session)
                    .await?;
                if attempt == 1 {
                    return Err(DbError::NotPrimary("primary stepped down".into()));
                }
                restaurants
                    .insert_one_with_session(json!({"_id": "burger", "name": "PyMongo Burger"}), &session)
                    .await?;
                Ok(())
            }
        })
        .await
        .unwrap();

    // The retry re-inserts "pizza" without a duplicate key error, so the first
    // attempt's insert never reached the store.
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(restaurants.count_documents(json!({})).await.unwrap(), 2);
}

#[tokio::test]
async fn test_transient_failures_exhaust_attempt_cap() {
    let (client, restaurants) = restaurant_client(fast_policy().max_attempts(3));
    client
        .fail_points()
        .configure(FailPoint::new(FailCommand::Insert, FailPointError::WriteConflict).always_on());
    let attempts = Arc::new(AtomicUsize::new(0));

    let err = insert_two_restaurants(&client, &restaurants, &attempts)
        .await
        .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(err.has_label(ErrorLabel::TransientTransaction));
    assert!(matches!(err.kind(), DbError::WriteConflict(_)));
    assert_eq!(restaurants.count_documents(json!({})).await.unwrap(), 0);
}

#[tokio::test]
async fn test_fatal_error_aborts_after_one_attempt() {
    let (client, restaurants) = restaurant_client(fast_policy());
    let session = client.start_session().await.unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));

    let err = session
        .with_transaction(|session| {
            let restaurants = restaurants.clone();
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                restaurants
                    .insert_one_with_session(json!({"name": "PyMongo Pizza"}), &session)
                    .await?;
                Err::<(), _>(DbError::Application("menu validation failed".into()))
            }
        })
        .await
        .unwrap_err();

    assert_eq!(err, DbError::Application("menu validation failed".into()));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(session.transaction_state().await, TransactionState::Aborted);
    assert_eq!(restaurants.count_documents(json!({})).await.unwrap(), 0);
}

#[tokio::test]
async fn test_duplicate_key_is_fatal() {
    let (client, restaurants) = restaurant_client(fast_policy());
    restaurants.insert_one(json!({"_id": "pizza"})).await.unwrap();
    let session = client.start_session().await.unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));

    let err = session
        .with_transaction(|session| {
            let restaurants = restaurants.clone();
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                restaurants
                    .insert_one_with_session(json!({"_id": "burger"}), &session)
                    .await?;
                restaurants
                    .insert_one_with_session(json!({"_id": "pizza"}), &session)
                    .await?;
                Ok(())
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::DuplicateKey(_)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(restaurants.count_documents(json!({})).await.unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_commit_result_retries_commit_only() {
    let (client, restaurants) = restaurant_client(fast_policy());
    client
        .fail_points()
        .configure(FailPoint::new(FailCommand::Commit, FailPointError::Network).times(2));
    let attempts = Arc::new(AtomicUsize::new(0));

    insert_two_restaurants(&client, &restaurants, &attempts).await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(restaurants.count_documents(json!({})).await.unwrap(), 2);
    assert_eq!(client.stats().await.transactions_committed, 1);
}

#[tokio::test]
async fn test_lost_commit_acknowledgement_applies_once() {
    let (client, restaurants) = restaurant_client(fast_policy());
    client.fail_points().configure(
        FailPoint::new(FailCommand::Commit, FailPointError::Network)
            .times(1)
            .apply_first(),
    );
    let attempts = Arc::new(AtomicUsize::new(0));

    insert_two_restaurants(&client, &restaurants, &attempts).await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(restaurants.count_documents(json!({})).await.unwrap(), 2);
    assert_eq!(client.stats().await.transactions_committed, 1);
}

#[tokio::test]
async fn test_commit_retries_exhausted_restart_transaction() {
    let policy = fast_policy().max_attempts(2).max_commit_attempts(3);
    let (client, restaurants) = restaurant_client(policy);
    client
        .fail_points()
        .configure(FailPoint::new(FailCommand::Commit, FailPointError::Network).always_on());
    let attempts = Arc::new(AtomicUsize::new(0));

    let err = insert_two_restaurants(&client, &restaurants, &attempts)
        .await
        .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(err.has_label(ErrorLabel::UnknownTransactionCommitResult));
    assert_eq!(restaurants.count_documents(json!({})).await.unwrap(), 0);
    assert_eq!(client.stats().await.transactions_aborted, 2);
}

#[tokio::test]
async fn test_timeout_stops_persistent_transient_failures() {
    let policy = fast_policy()
        .max_attempts(1_000)
        .timeout(Duration::from_millis(100));
    let (client, restaurants) = restaurant_client(policy);
    client
        .fail_points()
        .configure(FailPoint::new(FailCommand::Insert, FailPointError::Network).always_on());
    let attempts = Arc::new(AtomicUsize::new(0));

    let err = insert_two_restaurants(&client, &restaurants, &attempts)
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Timeout(_)));
    assert!(attempts.load(Ordering::SeqCst) > 1);
    assert_eq!(restaurants.count_documents(json!({})).await.unwrap(), 0);
}

#[tokio::test]
async fn test_max_elapsed_stops_retrying() {
    let policy = fast_policy()
        .max_attempts(1_000)
        .max_elapsed(Duration::from_millis(30));
    let (client, restaurants) = restaurant_client(policy);
    client.fail_points().configure(
        FailPoint::new(FailCommand::Insert, FailPointError::Network)
            .always_on()
            .block_time(Duration::from_millis(10)),
    );
    let attempts = Arc::new(AtomicUsize::new(0));

    let err = insert_two_restaurants(&client, &restaurants, &attempts)
        .await
        .unwrap_err();

    assert!(matches!(err.kind(), DbError::Network(_)));
    assert!(attempts.load(Ordering::SeqCst) < 1_000);
}

#[tokio::test]
async fn test_panicking_callback_aborts_transaction() {
    let (client, restaurants) = restaurant_client(fast_policy());
    let session = client.start_session().await.unwrap();
    let should_panic = true;

    let outcome = AssertUnwindSafe(session.with_transaction(|session| {
        let restaurants = restaurants.clone();
        async move {
            restaurants
                .insert_one_with_session(json!({"name": "PyMongo Pizza"}), &session)
                .await?;
            if should_panic {
                panic!("unit of work panicked");
            }
            Ok(())
        }
    }))
    .catch_unwind()
    .await;

    assert!(outcome.is_err());
    assert_eq!(session.transaction_state().await, TransactionState::Aborted);
    assert_eq!(restaurants.count_documents(json!({})).await.unwrap(), 0);
}

#[tokio::test]
async fn test_callback_panicking_before_returning_future_aborts_transaction() {
    let (client, restaurants) = restaurant_client(fast_policy());
    let session = client.start_session().await.unwrap();
    let should_panic = true;

    let outcome = AssertUnwindSafe(session.with_transaction(
        |_session| -> std::future::Ready<doctxn::Result<()>> {
            if should_panic {
                panic!("unit of work panicked while building its future");
            }
            std::future::ready(Ok(()))
        },
    ))
    .catch_unwind()
    .await;

    assert!(outcome.is_err());
    assert_eq!(session.transaction_state().await, TransactionState::Aborted);

    // The session is usable again.
    let attempts = Arc::new(AtomicUsize::new(0));
    insert_two_restaurants_with(&session, &restaurants, &attempts)
        .await
        .unwrap();
    assert_eq!(restaurants.count_documents(json!({})).await.unwrap(), 2);
    assert_eq!(session.transaction_state().await, TransactionState::Committed);
}

#[tokio::test]
async fn test_callback_may_commit_itself() {
    let (client, restaurants) = restaurant_client(fast_policy());
    let session = client.start_session().await.unwrap();

    session
        .with_transaction(|session| {
            let restaurants = restaurants.clone();
            async move {
                restaurants
                    .insert_one_with_session(json!({"name": "PyMongo Pizza"}), &session)
                    .await?;
                session.commit_transaction().await
            }
        })
        .await
        .unwrap();

    assert_eq!(restaurants.count_documents(json!({})).await.unwrap(), 1);
    assert_eq!(client.stats().await.transactions_committed, 1);
}

#[tokio::test]
async fn test_callback_may_abort_itself() {
    let (client, restaurants) = restaurant_client(fast_policy());
    let session = client.start_session().await.unwrap();

    let value = session
        .with_transaction(|session| {
            let restaurants = restaurants.clone();
            async move {
                restaurants
                    .insert_one_with_session(json!({"name": "PyMongo Pizza"}), &session)
                    .await?;
                session.abort_transaction().await?;
                Ok(7)
            }
        })
        .await
        .unwrap();

    assert_eq!(value, 7);
    assert_eq!(restaurants.count_documents(json!({})).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unacknowledged_write_concern_rejected() {
    let (client, _restaurants) = restaurant_client(fast_policy());
    let session = client.start_session().await.unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));

    let options = TransactionOptions::new().write_concern(WriteConcern::nodes(0));
    let err = session
        .with_transaction_opts(&options, &fast_policy(), |_session| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Validation(_)));
    assert_eq!(attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_reads_inside_transaction_see_own_writes() {
    let (client, restaurants) = restaurant_client(fast_policy());
    restaurants
        .insert_one(json!({"_id": "pizza", "name": "PyMongo Pizza", "cuisine": "Pizza"}))
        .await
        .unwrap();
    let session = client.start_session().await.unwrap();

    let seen = session
        .with_transaction(|session| {
            let restaurants = restaurants.clone();
            async move {
                restaurants
                    .replace_one_with_session(
                        json!({"_id": "pizza"}),
                        json!({"name": "PyMongo Pizza", "cuisine": "Neapolitan"}),
                        &session,
                    )
                    .await?;
                restaurants
                    .insert_one_with_session(json!({"_id": "burger", "name": "PyMongo Burger"}), &session)
                    .await?;

                let inside = restaurants.count_documents_with_session(json!({}), &session).await?;
                let outside = restaurants.count_documents(json!({})).await?;
                let cuisine = restaurants
                    .find_one_with_session(json!({"_id": "pizza"}), &session)
                    .await?
                    .and_then(|doc| doc.get("cuisine").cloned());
                Ok((inside, outside, cuisine))
            }
        })
        .await
        .unwrap();

    assert_eq!(seen, (2, 1, Some(json!("Neapolitan"))));
    assert_eq!(restaurants.count_documents(json!({})).await.unwrap(), 2);
}

#[tokio::test]
async fn test_delete_inside_transaction_is_atomic() {
    let (client, restaurants) = restaurant_client(fast_policy());
    restaurants
        .insert_many(vec![json!({"_id": "a"}), json!({"_id": "b"})])
        .await
        .unwrap();
    let session = client.start_session().await.unwrap();

    session.start_transaction(TransactionOptions::default()).await.unwrap();
    let deleted = restaurants
        .delete_one_with_session(json!({"_id": "a"}), &session)
        .await
        .unwrap();
    assert_eq!(deleted.deleted_count, 1);
    assert_eq!(restaurants.count_documents(json!({})).await.unwrap(), 2);

    session.abort_transaction().await.unwrap();
    assert_eq!(restaurants.count_documents(json!({})).await.unwrap(), 2);
}
