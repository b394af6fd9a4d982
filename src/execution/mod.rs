// Position state machine and order retry plumbing
pub mod position_manager;
pub mod retry;

pub use position_manager::{
    ClosedTrade, ExchangeHolding, ExitReason, PendingOrder, Position, PositionManager,
    PositionStatus, ReconciliationMismatch, TransitionError,
};
pub use retry::{with_retry, ExponentialBackoff, RetryPolicy};
