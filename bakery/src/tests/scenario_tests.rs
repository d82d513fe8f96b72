use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};

use tempfile::{tempdir, TempDir};

use crate::{
    config::BakeryConfig,
    customer::{Customer, CustomerAction, CustomerMachine, CustomerState},
    guard::NamedSemaphore,
    manager::{apply_status, count_leave, StatusOutcome},
    protocol::{OrderLine, OrderMessage, OrderResult},
    queue::{BoundedQueue, SharedQueue},
    seller::settle,
    state::SharedGame,
};

type TestResult = Result<(), Box<dyn Error>>;

// Each test gets its own segment directory and semaphore names.
fn isolated_config() -> Result<(BakeryConfig, TempDir), Box<dyn Error>> {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let dir = tempdir()?;
    let mut cfg = BakeryConfig::default();
    cfg.shmem.data_dir = dir.path().to_string_lossy().into_owned();
    cfg.shmem.ipc_prefix = format!("bakery-it-{}-{}", std::process::id(), COUNTER.fetch_add(1, Ordering::SeqCst));
    Ok((cfg, dir))
}

fn unlink_guards(cfg: &BakeryConfig) {
    for name in cfg.guard_names().all() {
        let _ = NamedSemaphore::unlink(name);
    }
}

fn queued(id: u32, pid: i32, patience: f32) -> CustomerMachine {
    let mut record = Customer::new(id, patience, 1.0);
    record.pid = pid;
    let mut machine = CustomerMachine::new(record, 0);
    machine.start();
    machine
}

#[test]
fn impatient_customer_leaves_and_the_rest_keep_waiting() -> TestResult {
    let (cfg, _dir) = isolated_config()?;
    let game = SharedGame::create(&cfg)?;
    let mut region = vec![0u8; BoundedQueue::<Customer>::required_size(4).ok_or("queue size")?];
    let mut queue = BoundedQueue::<Customer>::attach(&mut region, 4)?;

    let mut customers = vec![queued(1, 101, 5.0), queued(2, 102, 1.0), queued(3, 103, 10.0)];
    for c in &customers {
        queue.enqueue(*c.record())?;
    }

    for _ in 0..2 {
        for c in customers.iter_mut() {
            c.tick();
        }
    }

    assert_eq!(customers[1].state(), CustomerState::Frustrated);
    assert_eq!(customers[0].state(), CustomerState::WaitingInQueue);
    assert_eq!(customers[2].state(), CustomerState::WaitingInQueue);
    assert_eq!(customers[0].patience(), 3.0);
    assert_eq!(customers[2].patience(), 8.0);

    let mut left = Vec::new();
    for c in customers.iter_mut() {
        for status in c.drain_reports() {
            if let StatusOutcome::Left { pid, action } = apply_status(&mut queue, true, &status)? {
                count_leave(&game, pid, action)?;
                left.push((pid, action));
            }
        }
    }
    assert_eq!(left, vec![(102, CustomerAction::LeaveFrustrated)]);

    let remaining = queue.to_vec();
    assert_eq!(remaining.iter().map(|c| c.pid).collect::<Vec<_>>(), vec![101, 103]);
    assert_eq!(remaining.iter().map(|c| c.patience).collect::<Vec<_>>(), vec![3.0, 8.0]);
    assert!(remaining.iter().all(|c| c.state() == CustomerState::WaitingInQueue));
    assert_eq!(game.read().counters.frustrated, 1);

    drop(game);
    unlink_guards(&cfg);
    Ok(())
}

#[test]
fn complaints_open_and_close_the_cascade_window() -> TestResult {
    let (cfg, _dir) = isolated_config()?;
    let game = SharedGame::create(&cfg)?;
    count_leave(&game, 4242, CustomerAction::LeaveComplained)?;
    let state = game.read();
    assert_eq!(state.counters.complained, 1);
    assert!(state.cascade.is_contagious_for(4243));
    assert!(!state.cascade.is_contagious_for(4242));

    let window = cfg.customers.cascade_window_secs;
    let at = state.cascade.last_complaint_time;
    assert!(!game.with_cascade(|cascade, _| cascade.expire(at + window - 1.0, window))?);
    assert!(game.with_cascade(|cascade, _| cascade.expire(at + window + 1.0, window))?);
    assert!(!game.read().cascade.is_recent());

    count_leave(&game, 4243, CustomerAction::LeaveCascade)?;
    assert_eq!(game.read().counters.cascade, 1);
    assert!(count_leave(&game, 1, CustomerAction::StatusUpdate).is_err());

    drop(game);
    unlink_guards(&cfg);
    Ok(())
}

#[test]
fn queue_segment_is_shared_between_handles() -> TestResult {
    let (cfg, _dir) = isolated_config()?;
    let owner = SharedQueue::create(&cfg)?;
    let other = SharedQueue::open(&cfg)?;
    assert!(owner.is_owner());
    assert!(!other.is_owner());

    let mut record = Customer::new(9, 12.0, 1.0);
    record.pid = 909;
    owner.with_queue(|q| q.enqueue(record))??;
    assert_eq!(other.snapshot()?, vec![record]);
    assert_eq!(other.with_queue(|q| q.dequeue())??, record);
    assert!(owner.snapshot()?.is_empty());

    drop(other);
    drop(owner);
    unlink_guards(&cfg);
    Ok(())
}

#[test]
fn sales_reach_every_attached_process() -> TestResult {
    let (cfg, _dir) = isolated_config()?;
    let game = SharedGame::create(&cfg)?;
    let seller_view = SharedGame::open(&cfg)?;
    let stock = game.read().ready.get(0, 0);
    assert_eq!(stock, cfg.catalog[0].products[0].initial);

    let mut c = Customer::new(1, 10.0, 1.0);
    c.pid = 77;
    let order = OrderMessage::new(&c, &[OrderLine::new(0, 0, 1)], 0.0)?;
    let (result, price) = seller_view.with_ready(|ready, profit| settle(&cfg, ready, profit, &order))?;
    assert_eq!(result, OrderResult::Success);

    let after = game.read();
    assert_eq!(after.ready.get(0, 0), stock - 1);
    assert!((after.daily_profit - price as f64).abs() < 1e-6);

    drop(seller_view);
    drop(game);
    unlink_guards(&cfg);
    Ok(())
}
