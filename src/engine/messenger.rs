// ── Chatvend Engine: Messenger Port ────────────────────────────────────────
// Outbound surface the core consumes. The Telegram bridge implements it;
// tests substitute a recording fake. Inbound updates never cross this
// boundary — they are the bridge's own business.

use async_trait::async_trait;

use crate::atoms::error::EngineResult;
use crate::atoms::types::OutboundMessage;

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_message(&self, message: OutboundMessage) -> EngineResult<()>;
    /// Publish the command menu for a chat; admins see the admin set.
    async fn set_menu_commands(&self, chat_id: i64, is_admin: bool) -> EngineResult<()>;
}
