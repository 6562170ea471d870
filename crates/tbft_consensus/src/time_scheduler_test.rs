use std::time::Duration;

use tbft_protobuf::consensus::{Step, TimeoutInfo};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use crate::time_scheduler::TimeScheduler;

const CAPACITY: usize = 8;

fn timeout_info(millis: u64, height: u64, round: u32, step: Step) -> TimeoutInfo {
    TimeoutInfo::new(Duration::from_millis(millis), height, round, step)
}

async fn assert_silent(timeouts: &mut mpsc::Receiver<TimeoutInfo>) {
    assert!(timeout(Duration::from_secs(60), timeouts.recv()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn fires_after_duration() {
    let (scheduler, mut timeouts) = TimeScheduler::start("validator_0".to_string(), CAPACITY);
    let start = Instant::now();

    scheduler.add_timeout_info(timeout_info(1500, 1, 0, Step::Prevote));

    assert_eq!(timeouts.recv().await.unwrap(), timeout_info(1500, 1, 0, Step::Prevote));
    assert!(start.elapsed() >= Duration::from_millis(1500));
    assert_silent(&mut timeouts).await;
}

#[tokio::test(start_paused = true)]
async fn newer_request_replaces_armed_timer() {
    let (scheduler, mut timeouts) = TimeScheduler::start("validator_0".to_string(), CAPACITY);

    scheduler.add_timeout_info(timeout_info(10_000, 2, 0, Step::Prevote));
    scheduler.add_timeout_info(timeout_info(100, 2, 0, Step::Precommit));

    assert_eq!(timeouts.recv().await.unwrap().step, Step::Precommit);
    assert_silent(&mut timeouts).await;
}

#[tokio::test(start_paused = true)]
async fn stale_requests_are_never_armed() {
    let (scheduler, mut timeouts) = TimeScheduler::start("validator_0".to_string(), CAPACITY);

    scheduler.add_timeout_info(timeout_info(1000, 3, 1, Step::Prevote));
    // Older height, older round, older step and the same position.
    scheduler.add_timeout_info(timeout_info(10, 2, 5, Step::Commit));
    scheduler.add_timeout_info(timeout_info(10, 3, 0, Step::Commit));
    scheduler.add_timeout_info(timeout_info(10, 3, 1, Step::Propose));
    scheduler.add_timeout_info(timeout_info(10, 3, 1, Step::Prevote));

    let expired = timeouts.recv().await.unwrap();
    assert_eq!(expired, timeout_info(1000, 3, 1, Step::Prevote));
    assert_silent(&mut timeouts).await;
}

#[tokio::test(start_paused = true)]
async fn fired_position_stays_the_floor() {
    let (scheduler, mut timeouts) = TimeScheduler::start("validator_0".to_string(), CAPACITY);

    scheduler.add_timeout_info(timeout_info(10, 4, 0, Step::Precommit));
    assert_eq!(timeouts.recv().await.unwrap().position(), (4, 0, Step::Precommit));

    scheduler.add_timeout_info(timeout_info(10, 4, 0, Step::Prevote));
    assert_silent(&mut timeouts).await;

    scheduler.add_timeout_info(timeout_info(10, 4, 1, Step::Prevote));
    assert_eq!(timeouts.recv().await.unwrap().position(), (4, 1, Step::Prevote));
}

#[tokio::test(start_paused = true)]
async fn dropping_the_scheduler_closes_the_stream() {
    let (scheduler, mut timeouts) = TimeScheduler::start("validator_0".to_string(), CAPACITY);
    scheduler.add_timeout_info(timeout_info(10_000, 1, 0, Step::Prevote));
    drop(scheduler);

    assert_eq!(timeouts.recv().await, None);
}
