// ============================================================================
// Relay Engine
// ============================================================================
//
// The ordered, idempotent core of the platform: per-conversation sequencing,
// duplicate suppression, gap repair, and multi-device fanout. Everything here
// operates through the store traits; the engine itself holds no mutable
// state, so correctness under concurrency is entirely the store's discipline.
// ============================================================================

pub mod crypto;
pub mod fanout;
pub mod receipts;
pub mod repair;
pub mod send;

pub use fanout::{aggregate_delivery, FanoutDispatcher, UserDeliveryState};
pub use receipts::ReceiptOutcome;
pub use repair::PullPage;
pub use send::{RelayEngine, SendOutcome};
