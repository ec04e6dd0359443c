//! Idle worker reaper
//!
//! A single timer per pool. Arming only ever pulls the deadline earlier;
//! after each sweep the timer is re-armed for the oldest remaining idle
//! worker.

use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::{Receiver, RecvTimeoutError};

use super::pool::PoolShared;
use super::Routable;

pub(crate) enum TimerMsg {
    Arm(Instant),
    Stop,
}

fn reduce(current: Option<Instant>, requested: Instant) -> Option<Instant> {
    Some(match current {
        Some(at) if at <= requested => at,
        _ => requested,
    })
}

pub(crate) fn run<T: Routable>(shared: Arc<PoolShared<T>>, timer: Receiver<TimerMsg>) {
    let mut deadline: Option<Instant> = None;

    loop {
        let msg = match deadline {
            Some(at) => match timer.recv_deadline(at) {
                Ok(msg) => Some(msg),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return,
            },
            None => match timer.recv() {
                Ok(msg) => Some(msg),
                Err(_) => return,
            },
        };

        match msg {
            Some(TimerMsg::Arm(at)) => deadline = reduce(deadline, at),
            Some(TimerMsg::Stop) => return,
            None => {
                deadline = shared.sweep_idle(Instant::now());
            }
        }
    }
}
