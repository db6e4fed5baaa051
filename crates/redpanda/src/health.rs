//! Redpanda health checks.

use crate::client::{connect, within};
use crate::config::RedpandaConfig;
use digest_core::Error;
use tracing::{debug, error};

/// Check that the brokers are reachable and the incoming topic exists.
pub async fn check_connection(config: &RedpandaConfig) -> bool {
    let client = match connect(config).await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to connect to Redpanda: {}", e);
            return false;
        }
    };

    let listed = within(config.timeout(), "listing topics", async {
        client
            .list_topics()
            .await
            .map_err(|e| Error::broker(e.to_string()))
    })
    .await;

    match listed {
        Ok(topics) => {
            let found = topics.iter().any(|t| t.name == config.topic);
            if found {
                debug!(topics = topics.len(), "Redpanda connection healthy");
            } else {
                error!(topic = %config.topic, "Incoming topic does not exist");
            }
            found
        }
        Err(e) => {
            error!("Failed to list Redpanda topics: {}", e);
            false
        }
    }
}
