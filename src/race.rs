//! Race-session supervision: the gate that decides whether controller
//! output is allowed to reach the actuators at all. The actual
//! network-facing race supervisor (admission, scoring, multi-car
//! coordination) is out of scope; what lives here is the trait boundary
//! and a local, in-process implementation good enough to drive the
//! pipeline standalone.

use std::sync::{Arc, Mutex};

use log::info;
use tokio::time::{sleep, Duration};

use crate::state::RaceState;

pub trait RaceSupervisor {
    fn start_countdown(&self);
    fn stop(&self);
    fn state(&self) -> RaceState;
}

/// An in-process supervisor: `start_countdown()` spawns a tokio task
/// that flips to `Racing` after a fixed wait; `stop()` flips straight
/// back to `Idle`. Cheap to clone — every clone shares the same state.
#[derive(Clone)]
pub struct LocalRaceSupervisor {
    state: Arc<Mutex<RaceState>>,
    countdown_secs: f64,
}

impl LocalRaceSupervisor {
    pub fn new(countdown_secs: f64) -> Self {
        LocalRaceSupervisor {
            state: Arc::new(Mutex::new(RaceState::Idle)),
            countdown_secs,
        }
    }
}

impl RaceSupervisor for LocalRaceSupervisor {
    fn start_countdown(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == RaceState::Racing {
                return;
            }
            *state = RaceState::Countdown;
        }
        info!("[race] countdown started, {:.1}s to green", self.countdown_secs);

        let state = self.state.clone();
        let wait = Duration::from_secs_f64(self.countdown_secs.max(0.0));
        tokio::spawn(async move {
            sleep(wait).await;
            let mut guard = state.lock().unwrap();
            // Stop() may have fired mid-countdown; don't resurrect a
            // race that was explicitly cancelled.
            if *guard == RaceState::Countdown {
                *guard = RaceState::Racing;
                info!("[race] green flag, racing");
            }
        });
    }

    fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        *state = RaceState::Idle;
        info!("[race] stopped, back to idle");
    }

    fn state(&self) -> RaceState {
        *self.state.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn countdown_transitions_to_racing_after_delay() {
        let sup = LocalRaceSupervisor::new(0.05);
        assert_eq!(sup.state(), RaceState::Idle);
        sup.start_countdown();
        assert_eq!(sup.state(), RaceState::Countdown);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sup.state(), RaceState::Racing);
    }

    #[tokio::test]
    async fn stop_cancels_pending_countdown() {
        let sup = LocalRaceSupervisor::new(0.2);
        sup.start_countdown();
        sup.stop();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sup.state(), RaceState::Idle);
    }

    #[tokio::test]
    async fn stop_from_racing_returns_to_idle() {
        let sup = LocalRaceSupervisor::new(0.02);
        sup.start_countdown();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sup.state(), RaceState::Racing);
        sup.stop();
        assert_eq!(sup.state(), RaceState::Idle);
    }
}
