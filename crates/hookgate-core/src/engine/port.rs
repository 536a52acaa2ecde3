use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    engine::types::{EngineEvent, MediaAttachment, PairingEvent, Presence},
    Result,
};

/// Factory for engine clients.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Resolve the stored device for `identity`, or allocate a fresh, unassociated one
    /// when the identity is absent or unknown to the engine's device store.
    async fn open_client(&self, identity: Option<&str>) -> Result<Arc<dyn EngineClient>>;
}

/// One live protocol connection owned by a tenant session.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// The device already holds valid credentials (no pairing needed).
    fn has_credentials(&self) -> bool;

    fn push_name(&self) -> Option<String>;

    fn is_connected(&self) -> bool;

    /// Take the push-style event stream. Returns `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>>;

    /// Open the pairing event channel. Must be called before [`EngineClient::connect`]
    /// because pairing events only appear once the client starts connecting.
    async fn pairing_events(&self) -> Result<mpsc::UnboundedReceiver<PairingEvent>>;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self);

    /// Ask the engine for a short alphanumeric code for phone-number pairing.
    async fn request_pairing_code(&self, phone: &str) -> Result<String>;

    async fn download(&self, media: &MediaAttachment) -> Result<Vec<u8>>;

    async fn send_presence(&self, presence: Presence) -> Result<()>;
}
