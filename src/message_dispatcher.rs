use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

/// The application's inbound message handler, invoked from `process_messages`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, message_id: u32, payload: &[u8]);

    /// Maps a message to its obsolescence slot. A non-zero return groups the message with
    ///  all others of the same (message id, content id): only the newest member of the slot
    ///  is dispatched, and older stragglers are dropped. The default puts every message in
    ///  no slot at all.
    fn compute_content_id(&self, message_id: u32, payload: &[u8]) -> u32 {
        let _ = (message_id, payload);
        0
    }
}
