//! Queue publication port.

use async_trait::async_trait;
use serde_json::json;

use crate::Result;

/// Pushes serialized events onto the shared work queue.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    async fn publish(&self, token: &str, json_data: &str) -> Result<()>;
}

/// Queue record: `{"jsonData": <string>, "token": <string>}`.
pub fn queue_record(token: &str, json_data: &str) -> String {
    json!({ "jsonData": json_data, "token": token }).to_string()
}
