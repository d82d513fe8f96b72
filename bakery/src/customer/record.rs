use std::fmt;

use crate::core::ShmemCast;
use crate::errors::{BakeryError, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CustomerState {
    Walking = 0,
    WaitingInQueue = 1,
    Ordering = 2,
    WaitingForOrder = 3,
    Frustrated = 4,
    Complaining = 5,
    MissingOrder = 6,
    Contagion = 7,
}

impl CustomerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CustomerState::Frustrated
                | CustomerState::Complaining
                | CustomerState::MissingOrder
                | CustomerState::Contagion
        )
    }
}

impl TryFrom<u8> for CustomerState {
    type Error = BakeryError;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            0 => CustomerState::Walking,
            1 => CustomerState::WaitingInQueue,
            2 => CustomerState::Ordering,
            3 => CustomerState::WaitingForOrder,
            4 => CustomerState::Frustrated,
            5 => CustomerState::Complaining,
            6 => CustomerState::MissingOrder,
            7 => CustomerState::Contagion,
            _ => return Err(BakeryError::Codec(format!("unknown customer state {}", v))),
        })
    }
}

impl fmt::Display for CustomerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CustomerState::Walking => "walking",
            CustomerState::WaitingInQueue => "waiting-in-queue",
            CustomerState::Ordering => "ordering",
            CustomerState::WaitingForOrder => "waiting-for-order",
            CustomerState::Frustrated => "frustrated",
            CustomerState::Complaining => "complaining",
            CustomerState::MissingOrder => "missing-order",
            CustomerState::Contagion => "contagion",
        };
        f.write_str(s)
    }
}

/// What a status message asks the manager to do.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CustomerAction {
    StatusUpdate = 0,
    LeaveNormal = 1,
    LeaveFrustrated = 2,
    LeaveComplained = 3,
    LeaveMissingOrder = 4,
    LeaveCascade = 5,
}

impl CustomerAction {
    pub fn is_leave(self) -> bool {
        self != CustomerAction::StatusUpdate
    }
}

impl TryFrom<u8> for CustomerAction {
    type Error = BakeryError;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            0 => CustomerAction::StatusUpdate,
            1 => CustomerAction::LeaveNormal,
            2 => CustomerAction::LeaveFrustrated,
            3 => CustomerAction::LeaveComplained,
            4 => CustomerAction::LeaveMissingOrder,
            5 => CustomerAction::LeaveCascade,
            _ => return Err(BakeryError::Codec(format!("unknown customer action {}", v))),
        })
    }
}

/// Queue element and the customer process's own mirror of itself.
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(C)]
pub struct Customer {
    pub id: u32,
    pub pid: i32,
    pub patience: f32,
    pub initial_patience: f32,
    pub patience_decay: f32,
    pub complained: u8,
    state: u8,
    /// Set by the manager once the process has reported in and can take signals.
    checked_in: u8,
    _pad: u8,
}

unsafe impl ShmemCast for Customer {}

const RECORD_VERSION: &str = "c1";

impl Customer {
    pub fn new(id: u32, patience: f32, patience_decay: f32) -> Customer {
        Customer {
            id,
            pid: 0,
            patience,
            initial_patience: patience,
            patience_decay,
            complained: 0,
            state: CustomerState::Walking as u8,
            checked_in: 0,
            _pad: 0,
        }
    }

    /// Records hold only states this crate wrote; anything else reads as frustrated.
    pub fn state(&self) -> CustomerState {
        CustomerState::try_from(self.state).unwrap_or(CustomerState::Frustrated)
    }

    pub fn set_state(&mut self, state: CustomerState) {
        self.state = state as u8;
    }

    pub fn has_complained(&self) -> bool {
        self.complained != 0
    }

    pub fn is_checked_in(&self) -> bool {
        self.checked_in != 0
    }

    pub fn check_in(&mut self) {
        self.checked_in = 1;
    }

    /// `c1;id;pid;patience;initial_patience;decay;complained;state`
    pub fn encode(&self) -> String {
        format!(
            "{};{};{};{};{};{};{};{}",
            RECORD_VERSION,
            self.id,
            self.pid,
            self.patience,
            self.initial_patience,
            self.patience_decay,
            self.complained,
            self.state
        )
    }

    pub fn decode(text: &str) -> Result<Customer> {
        let fields: Vec<&str> = text.trim().split(';').collect();
        if fields.len() != 8 || fields[0] != RECORD_VERSION {
            return Err(BakeryError::Codec(format!("not a {} customer record: {:?}", RECORD_VERSION, text)));
        }
        fn parse<T: std::str::FromStr>(field: &str, name: &str) -> Result<T> {
            field
                .parse()
                .map_err(|_| BakeryError::Codec(format!("bad customer {}: {:?}", name, field)))
        }
        let state: u8 = parse(fields[7], "state")?;
        CustomerState::try_from(state)?;
        Ok(Customer {
            id: parse(fields[1], "id")?,
            pid: parse(fields[2], "pid")?,
            patience: parse(fields[3], "patience")?,
            initial_patience: parse(fields[4], "initial patience")?,
            patience_decay: parse(fields[5], "patience decay")?,
            complained: parse(fields[6], "complaint flag")?,
            state,
            checked_in: 0,
            _pad: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip() -> Result<()> {
        let mut c = Customer::new(17, 12.345, 0.75);
        c.pid = 4242;
        c.patience = 3.1;
        c.complained = 1;
        c.set_state(CustomerState::WaitingForOrder);
        let back = Customer::decode(&c.encode())?;
        assert_eq!(back.id, 17);
        assert_eq!(back.pid, 4242);
        assert!((back.patience - 3.1).abs() < 1e-6);
        assert!((back.initial_patience - 12.345).abs() < 1e-6);
        assert!((back.patience_decay - 0.75).abs() < 1e-6);
        assert!(back.has_complained());
        assert_eq!(back.state(), CustomerState::WaitingForOrder);
        Ok(())
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Customer::decode("c2;1;2;3;4;5;0;0").is_err());
        assert!(Customer::decode("c1;1;2;3").is_err());
        assert!(Customer::decode("c1;1;2;x;4;5;0;0").is_err());
        assert!(Customer::decode("c1;1;2;3;4;5;0;42").is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!CustomerState::Walking.is_terminal());
        assert!(!CustomerState::WaitingForOrder.is_terminal());
        assert!(CustomerState::Contagion.is_terminal());
        assert!(CustomerState::MissingOrder.is_terminal());
        assert!(!CustomerAction::StatusUpdate.is_leave());
        assert!(CustomerAction::LeaveCascade.is_leave());
    }
}
