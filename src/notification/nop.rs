use crate::notification::event::{EventMeta, PresenceEvent, PresenceListener, TransferEvent, TransferListener};

use async_trait::async_trait;

/// A listener that ignores every event. Used when nothing else is registered.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopListener {}

#[async_trait]
impl TransferListener for NopListener {
    async fn receive_transfer_event(&self, _: TransferEvent, _: EventMeta) {}
}

#[async_trait]
impl PresenceListener for NopListener {
    async fn receive_presence_event(&self, _: PresenceEvent, _: EventMeta) {}
}
