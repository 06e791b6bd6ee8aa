//! Notification event types
//!
//! Structured payloads with enough fields for an external formatter to render
//! a message without querying anything else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::exchanges::ExchangeKind;

/// Events the core publishes
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NotificationEvent {
    /// A scheduled purchase executed
    ScheduleFired {
        schedule_id: i64,
        exchange: ExchangeKind,
        amount: f64,
        filled_quantity: f64,
        avg_price: f64,
        order_id: String,
    },

    /// A scheduled purchase was skipped and parked in the reserve
    ScheduleSkipped {
        schedule_id: i64,
        exchange: ExchangeKind,
        amount: f64,
        reserve_after: f64,
    },

    /// The trend classification flipped
    TransitionDetected { previous: String, current: String },

    /// A bearish flip liquidated part of a holding into reserve
    HalfSellExecuted {
        exchange: ExchangeKind,
        sold_quantity: f64,
        proceeds: f64,
        avg_price: f64,
        reserve_after: f64,
        order_id: String,
    },

    /// A bullish flip redeployed reserve into a purchase
    ReserveRedeployed {
        exchange: ExchangeKind,
        spent: f64,
        filled_quantity: f64,
        avg_price: f64,
        reserve_after: f64,
        order_id: String,
    },

    /// A redeploy found nothing tradable (reserve below the venue minimum)
    ReserveRedeploySkipped {
        exchange: ExchangeKind,
        reserve: f64,
        reason: String,
    },

    /// An operator moved quote into or out of a reserve
    ManualTransfer {
        exchange: ExchangeKind,
        amount: f64,
        reserve_after: f64,
    },

    /// An adapter failed authentication and sat out this tick
    ExchangeUnhealthy { exchange: ExchangeKind, message: String },
}

impl NotificationEvent {
    /// Stable discriminant name for logs and external routing
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::ScheduleFired { .. } => "schedule_fired",
            NotificationEvent::ScheduleSkipped { .. } => "schedule_skipped",
            NotificationEvent::TransitionDetected { .. } => "transition_detected",
            NotificationEvent::HalfSellExecuted { .. } => "half_sell_executed",
            NotificationEvent::ReserveRedeployed { .. } => "reserve_redeployed",
            NotificationEvent::ReserveRedeploySkipped { .. } => "reserve_redeploy_skipped",
            NotificationEvent::ManualTransfer { .. } => "manual_transfer",
            NotificationEvent::ExchangeUnhealthy { .. } => "exchange_unhealthy",
        }
    }
}

/// An event with its publish timestamp and a unique id for external routing
#[derive(Clone, Debug)]
pub struct Notification {
    pub id: uuid::Uuid,
    pub event: NotificationEvent,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(event: NotificationEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            event,
            timestamp: Utc::now(),
        }
    }

    /// One-line text for the default log subscriber
    pub fn summary(&self) -> String {
        match &self.event {
            NotificationEvent::ScheduleFired {
                schedule_id,
                exchange,
                amount,
                filled_quantity,
                avg_price,
                order_id,
            } => format!(
                "schedule {} bought {:.2} USDT on {} ({:.8} @ {:.2}, order {})",
                schedule_id, amount, exchange, filled_quantity, avg_price, order_id
            ),
            NotificationEvent::ScheduleSkipped {
                schedule_id,
                exchange,
                amount,
                reserve_after,
            } => format!(
                "schedule {} skipped on {}: {:.2} USDT reserved (reserve now {:.2})",
                schedule_id, exchange, amount, reserve_after
            ),
            NotificationEvent::TransitionDetected { previous, current } => {
                format!("trend transition {} -> {}", previous, current)
            }
            NotificationEvent::HalfSellExecuted {
                exchange,
                sold_quantity,
                proceeds,
                avg_price,
                reserve_after,
                order_id,
            } => format!(
                "half-sell on {}: {:.8} @ {:.2} -> {:.2} USDT reserved (reserve now {:.2}, order {})",
                exchange, sold_quantity, avg_price, proceeds, reserve_after, order_id
            ),
            NotificationEvent::ReserveRedeployed {
                exchange,
                spent,
                filled_quantity,
                avg_price,
                reserve_after,
                order_id,
            } => format!(
                "reserve redeployed on {}: spent {:.2} USDT for {:.8} @ {:.2} (reserve now {:.2}, order {})",
                exchange, spent, filled_quantity, avg_price, reserve_after, order_id
            ),
            NotificationEvent::ReserveRedeploySkipped {
                exchange,
                reserve,
                reason,
            } => format!(
                "reserve redeploy skipped on {} ({:.2} USDT): {}",
                exchange, reserve, reason
            ),
            NotificationEvent::ManualTransfer {
                exchange,
                amount,
                reserve_after,
            } => format!(
                "manual transfer on {}: {:+.2} USDT (reserve now {:.2})",
                exchange, amount, reserve_after
            ),
            NotificationEvent::ExchangeUnhealthy { exchange, message } => {
                format!("{} marked unhealthy: {}", exchange, message)
            }
        }
    }
}
