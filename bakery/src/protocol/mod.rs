//! Messages exchanged between the actors, and the five channels carrying them.
//!
//! | channel               | direction             | type tag             |
//! |-----------------------|-----------------------|----------------------|
//! | status                | customer -> manager   | `STATUS_MTYPE`       |
//! | orders                | customer -> seller    | seller pid           |
//! | completions           | seller -> customer    | customer pid         |
//! | restock requests      | chef -> supply chain  | `RESTOCK_MTYPE`      |
//! | restock confirmations | supply chain -> chef  | `chef id + 1`        |

use std::fmt;
use std::str::FromStr;

use crate::channel::MessageQueue;
use crate::config::MAX_ORDER_ITEMS;
use crate::core::ShmemCast;
use crate::customer::{Customer, CustomerAction, CustomerState};
use crate::errors::{BakeryError, Result};

pub const STATUS_MTYPE: i64 = 1;
// Every request shares one tag, so the supply chain sees them in send order.
pub const RESTOCK_MTYPE: i64 = 1;

pub fn confirmation_mtype(chef_id: u32) -> i64 {
    chef_id as i64 + 1
}

#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(C)]
pub struct StatusMessage {
    pub customer_pid: i32,
    pub customer_id: u32,
    pub patience: f32,
    state: u8,
    action: u8,
    _pad: [u8; 2],
}

unsafe impl ShmemCast for StatusMessage {}

impl StatusMessage {
    pub fn new(customer: &Customer, action: CustomerAction) -> StatusMessage {
        StatusMessage {
            customer_pid: customer.pid,
            customer_id: customer.id,
            patience: customer.patience,
            state: customer.state() as u8,
            action: action as u8,
            _pad: [0; 2],
        }
    }

    pub fn state(&self) -> Result<CustomerState> {
        CustomerState::try_from(self.state)
    }

    pub fn action(&self) -> Result<CustomerAction> {
        CustomerAction::try_from(self.action)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct OrderLine {
    pub category: u8,
    pub product: u8,
    pub quantity: u8,
    _pad: u8,
}

impl OrderLine {
    pub fn new(category: u8, product: u8, quantity: u8) -> OrderLine {
        OrderLine { category, product, quantity, _pad: 0 }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(C)]
pub struct OrderMessage {
    pub customer_pid: i32,
    pub customer_id: u32,
    pub total_price: f32,
    item_count: u32,
    items: [OrderLine; MAX_ORDER_ITEMS],
}

unsafe impl ShmemCast for OrderMessage {}

impl OrderMessage {
    pub fn new(customer: &Customer, lines: &[OrderLine], total_price: f32) -> Result<OrderMessage> {
        if lines.is_empty() || lines.len() > MAX_ORDER_ITEMS {
            return Err(BakeryError::Logic(format!("an order holds 1..={} lines", MAX_ORDER_ITEMS)));
        }
        let mut items = [OrderLine::default(); MAX_ORDER_ITEMS];
        items[..lines.len()].copy_from_slice(lines);
        Ok(OrderMessage {
            customer_pid: customer.pid,
            customer_id: customer.id,
            total_price,
            item_count: lines.len() as u32,
            items,
        })
    }

    pub fn lines(&self) -> &[OrderLine] {
        let n = (self.item_count as usize).min(MAX_ORDER_ITEMS);
        &self.items[..n]
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OrderResult {
    Success = 0,
    Failed = 1,
    Missing = 2,
}

#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(C)]
pub struct CompletionMessage {
    pub customer_id: u32,
    pub total_price: f32,
    result: u8,
    _pad: [u8; 3],
}

unsafe impl ShmemCast for CompletionMessage {}

impl CompletionMessage {
    pub fn new(customer_id: u32, result: OrderResult, total_price: f32) -> CompletionMessage {
        CompletionMessage { customer_id, total_price, result: result as u8, _pad: [0; 3] }
    }

    pub fn result(&self) -> Result<OrderResult> {
        match self.result {
            0 => Ok(OrderResult::Success),
            1 => Ok(OrderResult::Failed),
            2 => Ok(OrderResult::Missing),
            v => Err(BakeryError::Codec(format!("unknown order result {}", v))),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct RestockRequest {
    pub chef_id: u32,
    pub ingredient: u32,
    pub quantity: i32,
    pub urgency: u32,
}

unsafe impl ShmemCast for RestockRequest {}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct RestockConfirmation {
    pub chef_id: u32,
    pub ingredient: u32,
    pub quantity: i32,
}

unsafe impl ShmemCast for RestockConfirmation {}

/// Queue identifiers handed to every spawned worker.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelIds {
    pub status: i32,
    pub orders: i32,
    pub completions: i32,
    pub restock_requests: i32,
    pub restock_confirmations: i32,
}

const CHANNEL_IDS_VERSION: &str = "q1";

/// `q1:status,orders,completions,restock_requests,restock_confirmations`
impl fmt::Display for ChannelIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{},{},{},{},{}",
            CHANNEL_IDS_VERSION,
            self.status,
            self.orders,
            self.completions,
            self.restock_requests,
            self.restock_confirmations
        )
    }
}

impl FromStr for ChannelIds {
    type Err = BakeryError;

    fn from_str(s: &str) -> Result<ChannelIds> {
        let bad = || BakeryError::Codec(format!("not a {} channel id record: {:?}", CHANNEL_IDS_VERSION, s));
        let (version, rest) = s.trim().split_once(':').ok_or_else(bad)?;
        if version != CHANNEL_IDS_VERSION {
            return Err(bad());
        }
        let ids = rest
            .split(',')
            .map(|v| v.parse::<i32>().map_err(|_| bad()))
            .collect::<Result<Vec<_>>>()?;
        match ids[..] {
            [status, orders, completions, restock_requests, restock_confirmations] => Ok(ChannelIds {
                status,
                orders,
                completions,
                restock_requests,
                restock_confirmations,
            }),
            _ => Err(bad()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Channels {
    pub status: MessageQueue<StatusMessage>,
    pub orders: MessageQueue<OrderMessage>,
    pub completions: MessageQueue<CompletionMessage>,
    pub restock_requests: MessageQueue<RestockRequest>,
    pub restock_confirmations: MessageQueue<RestockConfirmation>,
}

impl Channels {
    pub fn create() -> Result<Channels> {
        Ok(Channels {
            status: MessageQueue::create()?,
            orders: MessageQueue::create()?,
            completions: MessageQueue::create()?,
            restock_requests: MessageQueue::create()?,
            restock_confirmations: MessageQueue::create()?,
        })
    }

    pub fn from_ids(ids: &ChannelIds) -> Channels {
        Channels {
            status: MessageQueue::from_id(ids.status),
            orders: MessageQueue::from_id(ids.orders),
            completions: MessageQueue::from_id(ids.completions),
            restock_requests: MessageQueue::from_id(ids.restock_requests),
            restock_confirmations: MessageQueue::from_id(ids.restock_confirmations),
        }
    }

    pub fn ids(&self) -> ChannelIds {
        ChannelIds {
            status: self.status.id(),
            orders: self.orders.id(),
            completions: self.completions.id(),
            restock_requests: self.restock_requests.id(),
            restock_confirmations: self.restock_confirmations.id(),
        }
    }

    pub fn remove_all(&self) -> Result<()> {
        self.status.remove()?;
        self.orders.remove()?;
        self.completions.remove()?;
        self.restock_requests.remove()?;
        self.restock_confirmations.remove()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_ids_round_trip() -> Result<()> {
        let ids = ChannelIds {
            status: 1,
            orders: 32769,
            completions: 5,
            restock_requests: 0,
            restock_confirmations: 77,
        };
        let text = ids.to_string();
        assert_eq!(text, "q1:1,32769,5,0,77");
        assert_eq!(text.parse::<ChannelIds>()?, ids);
        assert!("q0:1,2,3,4,5".parse::<ChannelIds>().is_err());
        assert!("q1:1,2,3,4".parse::<ChannelIds>().is_err());
        Ok(())
    }

    #[test]
    fn order_lines_are_bounded() -> Result<()> {
        let customer = Customer::new(3, 10.0, 1.0);
        let lines = [OrderLine::new(0, 1, 2), OrderLine::new(1, 0, 1)];
        let order = OrderMessage::new(&customer, &lines, 9.5)?;
        assert_eq!(order.lines(), &lines);
        assert!(OrderMessage::new(&customer, &[], 0.0).is_err());
        let too_many = [OrderLine::new(0, 0, 1); MAX_ORDER_ITEMS + 1];
        assert!(OrderMessage::new(&customer, &too_many, 0.0).is_err());
        Ok(())
    }

    #[test]
    fn status_carries_state_and_action() -> Result<()> {
        let mut customer = Customer::new(8, 4.0, 1.0);
        customer.pid = 100;
        customer.set_state(CustomerState::Contagion);
        let status = StatusMessage::new(&customer, CustomerAction::LeaveCascade);
        assert_eq!(status.customer_pid, 100);
        assert_eq!(status.state()?, CustomerState::Contagion);
        assert_eq!(status.action()?, CustomerAction::LeaveCascade);
        Ok(())
    }

    #[test]
    fn completion_result_decodes() -> Result<()> {
        let done = CompletionMessage::new(4, OrderResult::Missing, 0.0);
        assert_eq!(done.result()?, OrderResult::Missing);
        Ok(())
    }
}
