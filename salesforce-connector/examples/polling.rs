//! Example of running the polling trigger against a live org.
//!
//! This example demonstrates:
//! - Loading settings from the environment
//! - Building a shared client cache
//! - Running two polling cycles, feeding the first cycle's snapshot into the second
//! - Reading lifecycle events from a channel emitter
//!
//! Required environment: `SALESFORCE_INSTANCE_URL`, `SALESFORCE_ACCESS_TOKEN`.
//! Optional: `SALESFORCE_REFRESH_TOKEN` with `OAUTH_CLIENT_ID` / `OAUTH_CLIENT_SECRET`,
//! `SALESFORCE_SOBJECT` (defaults to `Account`).

use salesforce_connector::cache::ClientCache;
use salesforce_connector::config::{Configuration, OAuthConfig, Settings};
use salesforce_connector::host::{ChannelEmitter, Event, Message};
use salesforce_connector::rest::RestClientFactory;
use salesforce_connector::trigger::PollingTrigger;
use serde_json::Value;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = Arc::new(Settings::from_env()?);
    let cache = Arc::new(ClientCache::new(Arc::new(RestClientFactory)));
    let trigger = PollingTrigger::new(settings, cache);

    let configuration = Configuration {
        sobject: Some(std::env::var("SALESFORCE_SOBJECT").unwrap_or_else(|_| "Account".into())),
        oauth: Some(OAuthConfig {
            access_token: std::env::var("SALESFORCE_ACCESS_TOKEN")?,
            instance_url: std::env::var("SALESFORCE_INSTANCE_URL")?,
            refresh_token: std::env::var("SALESFORCE_REFRESH_TOKEN").ok(),
        }),
        ..Default::default()
    };

    let mut snapshot: Option<Value> = None;
    for cycle in 1..=2 {
        info!(cycle, snapshot = ?snapshot, "Starting polling cycle");
        let (emitter, mut events) = ChannelEmitter::new();

        let reader = tokio::spawn(async move {
            let mut latest = None;
            while let Some(event) = events.next().await {
                match event {
                    Event::Data(message) => info!("Record: {}", message.body),
                    Event::Snapshot(value) => latest = Some(value),
                    Event::UpdateKeys(_) => info!("Credentials were refreshed"),
                    Event::Error(payload) => error!("{}: {}", payload.kind, payload.message),
                    Event::End => info!("Cycle finished"),
                }
            }
            latest
        });

        let result = trigger
            .process(
                &Message::default(),
                &configuration,
                snapshot.as_ref(),
                Arc::new(emitter),
            )
            .await;

        if let Some(next) = reader.await? {
            snapshot = Some(next);
        }
        result?;
    }

    info!(snapshot = ?snapshot, "Final watermark");
    Ok(())
}
