use anyhow::{Context, Result};
use doctxn::{
    Client, DbError, FailCommand, FailPoint, FailPointError, ReadConcern, TransactionOptions,
    WriteConcern,
};
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub url: String,
    pub transient_failures: u32,
    pub commit_failures: u32,
    pub lost_ack: bool,
    pub fatal: bool,
    pub json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Restaurant {
    pub name: String,
    pub cuisine: String,
}

impl Restaurant {
    fn new(name: &str, cuisine: &str) -> Self {
        Self {
            name: name.to_string(),
            cuisine: cuisine.to_string(),
        }
    }
}

/// Outcome of one demo run.
#[derive(Debug)]
pub struct DemoReport {
    pub attempts: usize,
    pub outcome: std::result::Result<(), DbError>,
    pub restaurants: Vec<Restaurant>,
}

pub async fn run(options: &DemoOptions) -> Result<()> {
    let client = Client::connect_url(&options.url)
        .with_context(|| format!("invalid connection string '{}'", options.url))?;

    let report = execute(&client, options).await?;

    match &report.outcome {
        Ok(()) => println!("Transaction succeeded after {} attempt(s)", report.attempts),
        Err(err) => println!("Transaction failed after {} attempt(s): {err}", report.attempts),
    }

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report.restaurants)?);
        println!("{}", serde_json::to_string_pretty(&client.stats().await)?);
    } else {
        for restaurant in &report.restaurants {
            println!("  {} ({})", restaurant.name, restaurant.cuisine);
        }
    }

    client.close().await;
    Ok(())
}

/// Inserts two restaurants in one transaction with the requested failures armed.
pub async fn execute(client: &Client, options: &DemoOptions) -> Result<DemoReport> {
    arm_fail_points(client, options);

    let restaurants = client
        .database("sample_restaurants")
        .collection("restaurants");
    let txn_options = TransactionOptions::new()
        .write_concern(WriteConcern::majority())
        .read_concern(ReadConcern::Local);
    let policy = client.config().retry_policy.clone();

    let attempts = Arc::new(AtomicUsize::new(0));
    let fatal = options.fatal;

    let session = client.start_session().await?;
    let outcome = session
        .with_transaction_opts(&txn_options, &policy, |session| {
            let restaurants = restaurants.clone();
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                restaurants
                    .insert_one_with_session(Restaurant::new("PyMongo Pizza", "Pizza"), &session)
                    .await?;
                if fatal {
                    return Err(DbError::Application(
                        "kitchen closed before the second insert".into(),
                    ));
                }
                restaurants
                    .insert_one_with_session(Restaurant::new("PyMongo Burger", "Burger"), &session)
                    .await?;
                Ok(())
            }
        })
        .await;
    session.end_session().await;

    info!("Demo finished: {:?}", client.stats().await);

    Ok(DemoReport {
        attempts: attempts.load(Ordering::SeqCst),
        outcome,
        restaurants: restaurants.find_as(serde_json::json!({})).await?,
    })
}

fn arm_fail_points(client: &Client, options: &DemoOptions) {
    let fail_points = client.fail_points();

    if options.transient_failures > 0 {
        fail_points.configure(
            FailPoint::new(FailCommand::Insert, FailPointError::Network)
                .times(options.transient_failures),
        );
    }

    if options.commit_failures > 0 {
        let mut point = FailPoint::new(FailCommand::Commit, FailPointError::Network)
            .times(options.commit_failures);
        if options.lost_ack {
            point = point.apply_first();
        }
        fail_points.configure(point);
    }
}
