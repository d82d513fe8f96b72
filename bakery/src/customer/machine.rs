use rand::Rng;

use crate::config::{BakeryConfig, CustomerConfig};
use crate::protocol::{OrderLine, OrderResult, StatusMessage};
use crate::state::CascadeState;

use super::record::{Customer, CustomerAction, CustomerState};

/// The customer's authoritative state. Every transition queues a status
/// report; the owning process drains and sends them.
#[derive(Debug)]
pub struct CustomerMachine {
    record: Customer,
    walk_ticks_left: u32,
    left: bool,
    outbox: Vec<StatusMessage>,
}

impl CustomerMachine {
    pub fn new(record: Customer, walk_ticks: u32) -> CustomerMachine {
        CustomerMachine { record, walk_ticks_left: walk_ticks, left: false, outbox: Vec::new() }
    }

    pub fn record(&self) -> &Customer {
        &self.record
    }

    pub fn state(&self) -> CustomerState {
        self.record.state()
    }

    pub fn patience(&self) -> f32 {
        self.record.patience
    }

    /// True once a leave action has been reported.
    pub fn has_left(&self) -> bool {
        self.left
    }

    pub fn drain_reports(&mut self) -> Vec<StatusMessage> {
        std::mem::take(&mut self.outbox)
    }

    fn report(&mut self, action: CustomerAction) {
        self.outbox.push(StatusMessage::new(&self.record, action));
        if action.is_leave() {
            self.left = true;
        }
    }

    fn enter(&mut self, state: CustomerState) {
        self.record.set_state(state);
        self.report(CustomerAction::StatusUpdate);
    }

    fn leave(&mut self, state: CustomerState, action: CustomerAction) {
        self.record.set_state(state);
        self.report(action);
    }

    /// Called once the process can take signals. Always reports, so the
    /// manager knows sellers may select it. A customer with no walk goes
    /// straight to the queue.
    pub fn start(&mut self) {
        if self.state() == CustomerState::Walking && self.walk_ticks_left == 0 {
            self.enter(CustomerState::WaitingInQueue);
        } else {
            self.report(CustomerAction::StatusUpdate);
        }
    }

    /// One decay period. Patience drains in every state but ORDERING; running
    /// out is final.
    pub fn tick(&mut self) {
        if self.left || self.state() == CustomerState::Ordering {
            return;
        }
        self.record.patience -= self.record.patience_decay;
        if self.record.patience <= 0.0 {
            self.leave(CustomerState::Frustrated, CustomerAction::LeaveFrustrated);
            return;
        }
        if self.state() == CustomerState::Walking {
            self.walk_ticks_left = self.walk_ticks_left.saturating_sub(1);
            if self.walk_ticks_left == 0 {
                self.enter(CustomerState::WaitingInQueue);
                return;
            }
        }
        self.report(CustomerAction::StatusUpdate);
    }

    /// A seller picked this customer. Returns true when the customer is now
    /// ordering. A walking customer is taken straight to the counter.
    pub fn select(&mut self) -> bool {
        if self.left {
            return false;
        }
        match self.state() {
            CustomerState::Walking | CustomerState::WaitingInQueue => {
                self.record.patience = self.record.initial_patience;
                self.enter(CustomerState::Ordering);
                true
            }
            _ => false,
        }
    }

    pub fn order_sent(&mut self) {
        if !self.left && self.state() == CustomerState::Ordering {
            self.enter(CustomerState::WaitingForOrder);
        }
    }

    /// Seller's reply. A failed order ends frustrated, or complaining when
    /// `complaint_roll < complaint_probability`.
    pub fn complete(&mut self, result: OrderResult, complaint_roll: f64, complaint_probability: f64) {
        if self.left {
            return;
        }
        match result {
            OrderResult::Success => {
                let state = self.state();
                self.leave(state, CustomerAction::LeaveNormal);
            }
            OrderResult::Missing => self.leave(CustomerState::MissingOrder, CustomerAction::LeaveMissingOrder),
            OrderResult::Failed => {
                if complaint_roll < complaint_probability {
                    self.record.complained = 1;
                    self.leave(CustomerState::Complaining, CustomerAction::LeaveComplained);
                } else {
                    self.leave(CustomerState::Frustrated, CustomerAction::LeaveFrustrated);
                }
            }
        }
    }

    /// A channel error. Leaves frustrated so the manager's books close.
    pub fn communication_failed(&mut self) {
        if !self.left {
            self.leave(CustomerState::Frustrated, CustomerAction::LeaveFrustrated);
        }
    }

    /// Social proof: a recent complaint by someone else makes this customer
    /// walk out when `roll < probability`. Returns true if it did.
    pub fn check_contagion(&mut self, cascade: &CascadeState, roll: f64, probability: f64) -> bool {
        if self.left || self.state().is_terminal() {
            return false;
        }
        if cascade.is_contagious_for(self.record.pid) && roll < probability {
            self.leave(CustomerState::Contagion, CustomerAction::LeaveCascade);
            return true;
        }
        false
    }
}

/// Fresh record with patience and decay drawn inside the configured bounds.
pub fn random_customer<R: Rng>(id: u32, cfg: &CustomerConfig, rng: &mut R) -> Customer {
    let patience = if cfg.min_patience < cfg.max_patience {
        rng.gen_range(cfg.min_patience..=cfg.max_patience)
    } else {
        cfg.min_patience
    };
    let decay = if cfg.min_patience_decay < cfg.max_patience_decay {
        rng.gen_range(cfg.min_patience_decay..=cfg.max_patience_decay)
    } else {
        cfg.min_patience_decay
    };
    Customer::new(id, patience, decay)
}

/// 1..=max_order_items random lines from the catalog, with their total price.
pub fn random_order<R: Rng>(cfg: &BakeryConfig, rng: &mut R) -> (Vec<OrderLine>, f32) {
    let c = &cfg.customers;
    let count = rng.gen_range(1..=c.max_order_items.max(1)) as usize;
    let mut lines = Vec::with_capacity(count);
    let mut total = 0.0f32;
    for _ in 0..count {
        let category = rng.gen_range(0..cfg.catalog.len());
        let product = rng.gen_range(0..cfg.catalog[category].products.len());
        let quantity = rng.gen_range(c.min_item_quantity..=c.max_item_quantity.max(c.min_item_quantity));
        total += cfg.catalog[category].products[product].price * quantity as f32;
        lines.push(OrderLine::new(category as u8, product as u8, quantity.min(255) as u8));
    }
    (lines, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn waiting(patience: f32, decay: f32) -> CustomerMachine {
        let mut m = CustomerMachine::new(Customer::new(1, patience, decay), 0);
        m.start();
        m.drain_reports();
        m
    }

    fn actions(m: &mut CustomerMachine) -> Vec<CustomerAction> {
        m.drain_reports().iter().map(|s| s.action().unwrap()).collect()
    }

    #[test]
    fn walking_then_queueing() {
        let mut m = CustomerMachine::new(Customer::new(1, 10.0, 1.0), 2);
        m.start();
        assert_eq!(m.state(), CustomerState::Walking);
        assert_eq!(m.drain_reports().len(), 1);
        m.tick();
        assert_eq!(m.state(), CustomerState::Walking);
        m.tick();
        assert_eq!(m.state(), CustomerState::WaitingInQueue);
        let reports = m.drain_reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].state().unwrap(), CustomerState::WaitingInQueue);
        assert_eq!(m.patience(), 8.0);
    }

    #[test]
    fn patience_strictly_decreases_until_frustrated() {
        let mut m = waiting(3.5, 1.0);
        let mut last = m.patience();
        while !m.has_left() {
            m.tick();
            if !m.has_left() {
                assert!(m.patience() < last);
                last = m.patience();
            }
        }
        assert_eq!(m.state(), CustomerState::Frustrated);
        assert!(m.patience() <= 0.0);
        let frozen = m.patience();
        m.tick();
        m.tick();
        assert_eq!(m.patience(), frozen);
        assert_eq!(m.state(), CustomerState::Frustrated);
        assert!(!m.select());
        let acts = actions(&mut m);
        assert_eq!(acts.last(), Some(&CustomerAction::LeaveFrustrated));
        assert_eq!(acts.iter().filter(|a| a.is_leave()).count(), 1);
    }

    #[test]
    fn ordering_pauses_decay_and_select_restores_patience() {
        let mut m = waiting(5.0, 1.0);
        m.tick();
        m.tick();
        assert_eq!(m.patience(), 3.0);
        assert!(m.select());
        assert_eq!(m.state(), CustomerState::Ordering);
        assert_eq!(m.patience(), 5.0);
        m.tick();
        assert_eq!(m.patience(), 5.0);
        m.order_sent();
        assert_eq!(m.state(), CustomerState::WaitingForOrder);
        m.complete(OrderResult::Success, 0.0, 1.0);
        assert!(m.has_left());
        assert_eq!(actions(&mut m).last(), Some(&CustomerAction::LeaveNormal));
    }

    #[test]
    fn reply_outcomes() {
        let mut missing = waiting(5.0, 1.0);
        missing.select();
        missing.order_sent();
        missing.complete(OrderResult::Missing, 0.0, 1.0);
        assert_eq!(missing.state(), CustomerState::MissingOrder);
        assert_eq!(actions(&mut missing).last(), Some(&CustomerAction::LeaveMissingOrder));

        let mut complains = waiting(5.0, 1.0);
        complains.select();
        complains.order_sent();
        complains.complete(OrderResult::Failed, 0.1, 0.5);
        assert_eq!(complains.state(), CustomerState::Complaining);
        assert!(complains.record().has_complained());
        assert_eq!(actions(&mut complains).last(), Some(&CustomerAction::LeaveComplained));

        let mut sulks = waiting(5.0, 1.0);
        sulks.select();
        sulks.order_sent();
        sulks.complete(OrderResult::Failed, 0.9, 0.5);
        assert_eq!(sulks.state(), CustomerState::Frustrated);
        assert!(!sulks.record().has_complained());
    }

    #[test]
    fn communication_failure_leaves_frustrated_once() {
        let mut m = waiting(5.0, 1.0);
        m.select();
        m.communication_failed();
        m.communication_failed();
        let acts = actions(&mut m);
        assert_eq!(acts.iter().filter(|a| **a == CustomerAction::LeaveFrustrated).count(), 1);
    }

    #[test]
    fn contagion_needs_someone_elses_recent_complaint() {
        let mut own = CascadeState::default();
        let mut m = waiting(5.0, 1.0);
        let pid = m.record().pid;
        assert!(!m.check_contagion(&own, 0.0, 1.0));
        own.record_complaint(pid, 0.0);
        assert!(!m.check_contagion(&own, 0.0, 1.0));

        let mut other = CascadeState::default();
        other.record_complaint(pid + 1, 0.0);
        assert!(!m.check_contagion(&other, 0.8, 0.5));
        assert!(m.check_contagion(&other, 0.2, 0.5));
        assert_eq!(m.state(), CustomerState::Contagion);
        assert_eq!(actions(&mut m), vec![CustomerAction::LeaveCascade]);
        assert!(!m.check_contagion(&other, 0.0, 1.0));
    }

    #[test]
    fn random_records_respect_bounds() {
        let cfg = CustomerConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        for id in 0..50 {
            let c = random_customer(id, &cfg, &mut rng);
            assert!(c.patience >= cfg.min_patience && c.patience <= cfg.max_patience);
            assert!(c.patience_decay >= cfg.min_patience_decay && c.patience_decay <= cfg.max_patience_decay);
            assert_eq!(c.patience, c.initial_patience);
            assert_eq!(c.state(), CustomerState::Walking);
        }
    }

    #[test]
    fn random_orders_come_from_the_catalog() {
        let cfg = BakeryConfig::default();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            let (lines, total) = random_order(&cfg, &mut rng);
            assert!(!lines.is_empty() && lines.len() <= cfg.customers.max_order_items as usize);
            let mut expected = 0.0f32;
            for l in &lines {
                let p = cfg.product(l.category as usize, l.product as usize).unwrap();
                assert!(l.quantity as u32 >= cfg.customers.min_item_quantity);
                assert!(l.quantity as u32 <= cfg.customers.max_item_quantity);
                expected += p.price * l.quantity as f32;
            }
            assert!((expected - total).abs() < 1e-3);
        }
    }
}
