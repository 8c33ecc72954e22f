// ── Chatvend Engine: Use-Case Layer ────────────────────────────────────────
// Orchestrators over the repositories and the external ports. Each service
// is a thin Arc-able struct; everything transactional goes through
// `Store::with_tx` and every status transition is checked for lost races.

pub mod chat;
pub mod payment;
pub mod privacy;
pub mod stats;
pub mod subscription;
