use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Quantities closer than this are treated as equal (8 exchange decimals)
pub const QUANTITY_EPSILON: f64 = 1e-8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionStatus {
    Flat,
    /// Buy submitted, fill not yet confirmed
    Entering,
    Long,
    /// Sell submitted, fill not yet confirmed
    Exiting,
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PositionStatus::Flat => "FLAT",
            PositionStatus::Entering => "ENTERING",
            PositionStatus::Long => "LONG",
            PositionStatus::Exiting => "EXITING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    StrategySell, // Strategy-driven sell signal
}

/// Position record for one market.
///
/// FLAT => quantity = 0 and entry_price = 0.
/// LONG => quantity > 0 and highest_price_since_entry >= entry_price.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub market: String,
    pub status: PositionStatus,
    pub entry_price: f64,
    pub quantity: f64,
    pub highest_price_since_entry: f64,
    pub entered_at: Option<DateTime<Utc>>,
}

impl Position {
    fn flat(market: &str) -> Self {
        Self {
            market: market.to_string(),
            status: PositionStatus::Flat,
            entry_price: 0.0,
            quantity: 0.0,
            highest_price_since_entry: 0.0,
            entered_at: None,
        }
    }

    /// Unrealized P&L in quote currency at `current_price`
    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        (current_price - self.entry_price) * self.quantity
    }
}

/// Order the machine is waiting on
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOrder {
    pub order_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub exit_reason: Option<ExitReason>,
}

/// Result of a confirmed exit
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedTrade {
    pub market: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub realized_pnl: f64,
    pub reason: ExitReason,
    /// Quantity still held after a partial sell; zero once FLAT
    pub remaining_quantity: f64,
}

impl ClosedTrade {
    pub fn is_partial(&self) -> bool {
        self.remaining_quantity > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    #[error("{market}: cannot {event} while {from}")]
    Illegal {
        market: String,
        from: PositionStatus,
        event: &'static str,
    },

    #[error("{market}: invalid fill (price {price}, quantity {quantity})")]
    InvalidFill {
        market: String,
        price: f64,
        quantity: f64,
    },
}

/// Local position disagreed with the exchange and was overwritten
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationMismatch {
    pub market: String,
    pub local_status: PositionStatus,
    pub local_quantity: f64,
    pub exchange_quantity: f64,
}

impl fmt::Display for ReconciliationMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: local {} qty {} vs exchange qty {}",
            self.market, self.local_status, self.local_quantity, self.exchange_quantity
        )
    }
}

/// Holding reported by the exchange for reconciliation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExchangeHolding {
    pub quantity: f64,
    pub avg_buy_price: f64,
}

/// Authoritative in-process state machine for one market's position.
///
/// The position is only ever changed through the transition methods below.
#[derive(Debug, Clone)]
pub struct PositionManager {
    position: Position,
    pending: Option<PendingOrder>,
}

impl PositionManager {
    pub fn new(market: &str) -> Self {
        Self {
            position: Position::flat(market),
            pending: None,
        }
    }

    pub fn market(&self) -> &str {
        &self.position.market
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn status(&self) -> PositionStatus {
        self.position.status
    }

    pub fn pending(&self) -> Option<&PendingOrder> {
        self.pending.as_ref()
    }

    fn illegal(&self, event: &'static str) -> TransitionError {
        TransitionError::Illegal {
            market: self.position.market.clone(),
            from: self.position.status,
            event,
        }
    }

    fn require(&self, expected: PositionStatus, event: &'static str) -> Result<(), TransitionError> {
        if self.position.status != expected {
            return Err(self.illegal(event));
        }
        Ok(())
    }

    /// FLAT -> ENTERING on an authorized buy decision
    pub fn begin_entry(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.require(PositionStatus::Flat, "begin entry")?;
        self.position.status = PositionStatus::Entering;
        self.pending = Some(PendingOrder {
            order_id: None,
            submitted_at: now,
            exit_reason: None,
        });
        Ok(())
    }

    /// Attach the exchange order id once the order was accepted
    pub fn attach_order(&mut self, order_id: &str) -> Result<(), TransitionError> {
        match (&mut self.pending, self.position.status) {
            (Some(pending), PositionStatus::Entering | PositionStatus::Exiting) => {
                pending.order_id = Some(order_id.to_string());
                Ok(())
            }
            _ => Err(self.illegal("attach order")),
        }
    }

    /// ENTERING -> LONG on a confirmed fill
    pub fn confirm_entry(
        &mut self,
        fill_price: f64,
        quantity: f64,
        filled_at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.require(PositionStatus::Entering, "confirm entry")?;
        if !(fill_price > 0.0 && quantity > 0.0) {
            return Err(TransitionError::InvalidFill {
                market: self.position.market.clone(),
                price: fill_price,
                quantity,
            });
        }

        self.position.status = PositionStatus::Long;
        self.position.entry_price = fill_price;
        self.position.quantity = quantity;
        self.position.highest_price_since_entry = fill_price;
        self.position.entered_at = Some(filled_at);
        self.pending = None;
        Ok(())
    }

    /// ENTERING -> FLAT when the buy failed or was cancelled unfilled
    pub fn fail_entry(&mut self) -> Result<(), TransitionError> {
        self.require(PositionStatus::Entering, "fail entry")?;
        self.position = Position::flat(&self.position.market);
        self.pending = None;
        Ok(())
    }

    /// LONG -> LONG high-water ratchet. Returns true when the high moved.
    pub fn update_price(&mut self, current_price: f64) -> bool {
        if self.position.status != PositionStatus::Long {
            return false;
        }
        if current_price > self.position.highest_price_since_entry {
            self.position.highest_price_since_entry = current_price;
            return true;
        }
        false
    }

    /// LONG -> EXITING on a sell signal or stop-loss trigger
    pub fn begin_exit(
        &mut self,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.require(PositionStatus::Long, "begin exit")?;
        self.position.status = PositionStatus::Exiting;
        self.pending = Some(PendingOrder {
            order_id: None,
            submitted_at: now,
            exit_reason: Some(reason),
        });
        Ok(())
    }

    /// EXITING -> FLAT on a confirmed sell fill.
    ///
    /// A fill short of the held quantity books P&L on the sold part only and
    /// goes back to LONG with the remainder, keeping entry price and high.
    pub fn confirm_exit(
        &mut self,
        fill_price: f64,
        executed_quantity: f64,
        fee: f64,
    ) -> Result<ClosedTrade, TransitionError> {
        self.require(PositionStatus::Exiting, "confirm exit")?;
        if !(fill_price > 0.0 && executed_quantity > 0.0) {
            return Err(TransitionError::InvalidFill {
                market: self.position.market.clone(),
                price: fill_price,
                quantity: executed_quantity,
            });
        }

        let reason = self
            .pending
            .as_ref()
            .and_then(|p| p.exit_reason)
            .unwrap_or(ExitReason::StrategySell);
        let sold = executed_quantity.min(self.position.quantity);
        let remaining = self.position.quantity - sold;
        let trade = ClosedTrade {
            market: self.position.market.clone(),
            entry_price: self.position.entry_price,
            exit_price: fill_price,
            quantity: sold,
            realized_pnl: (fill_price - self.position.entry_price) * sold - fee,
            reason,
            remaining_quantity: 0.0,
        };

        self.pending = None;
        if remaining > QUANTITY_EPSILON {
            self.position.status = PositionStatus::Long;
            self.position.quantity = remaining;
            return Ok(ClosedTrade {
                remaining_quantity: remaining,
                ..trade
            });
        }

        self.position = Position::flat(&self.position.market);
        Ok(trade)
    }

    /// EXITING -> LONG when the sell failed; the position is unchanged
    pub fn fail_exit(&mut self) -> Result<(), TransitionError> {
        self.require(PositionStatus::Exiting, "fail exit")?;
        self.position.status = PositionStatus::Long;
        self.pending = None;
        Ok(())
    }

    /// Overwrite local state with the exchange's view.
    ///
    /// `holding` is `None` when the exchange reports no (non-dust) balance.
    /// Any pending order is dropped, so callers resolve it first.
    pub fn reconcile(
        &mut self,
        holding: Option<ExchangeHolding>,
        now: DateTime<Utc>,
    ) -> Option<ReconciliationMismatch> {
        let before = self.position.clone();
        let exchange_quantity = holding.map(|h| h.quantity).unwrap_or(0.0);

        let mismatch = || ReconciliationMismatch {
            market: before.market.clone(),
            local_status: before.status,
            local_quantity: before.quantity,
            exchange_quantity,
        };

        match holding {
            None => {
                if before.status == PositionStatus::Flat {
                    return None;
                }
                self.position = Position::flat(&before.market);
                self.pending = None;
                Some(mismatch())
            }
            Some(h) => {
                let matches_long = before.status == PositionStatus::Long
                    && (before.quantity - h.quantity).abs() <= QUANTITY_EPSILON;
                if matches_long {
                    return None;
                }

                if matches!(before.status, PositionStatus::Long | PositionStatus::Exiting) {
                    // Keep our own fill price and high; only the size drifted
                    self.position.status = PositionStatus::Long;
                    self.position.quantity = h.quantity;
                } else {
                    let entry = if h.avg_buy_price > 0.0 {
                        h.avg_buy_price
                    } else {
                        before.entry_price
                    };
                    self.position = Position {
                        market: before.market.clone(),
                        status: PositionStatus::Long,
                        entry_price: entry,
                        quantity: h.quantity,
                        highest_price_since_entry: entry,
                        entered_at: Some(now),
                    };
                }
                self.pending = None;
                Some(mismatch())
            }
        }
    }

    /// Check the position invariants (used by tests and debug assertions)
    pub fn invariants_hold(&self) -> bool {
        let p = &self.position;
        match p.status {
            PositionStatus::Flat | PositionStatus::Entering => {
                p.quantity == 0.0 && p.entry_price == 0.0
            }
            PositionStatus::Long | PositionStatus::Exiting => {
                p.quantity > 0.0 && p.highest_price_since_entry >= p.entry_price
            }
        }
    }
}
