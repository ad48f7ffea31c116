/*!
    lifecycle of the application run by the master: idle, starting, running, stopping

    The lifecycle is an explicit transition table. The caller fires triggers and ticks the controller with the current time, starting and stopping complete by themselves once their delay elapsed at a tick.
*/

use core::fmt;
use std::time::{Duration, Instant};
use log::info;
use crate::error::{EthercatError, EthercatResult};


#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RunState {
    Initialising,
    Idle,
    Starting,
    Running,
    Stopping,
    Aborted,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Trigger {
    Initialise,
    Start,
    StartCompleted,
    Stop,
    StopCompleted,
    Abort,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// run controller, see the module documentation
#[derive(Clone, Debug)]
pub struct Controller {
    state: RunState,
    /// moment the current state was entered
    entered: Instant,
    start_delay: Duration,
    stop_delay: Duration,
}

impl Controller {
    /// controller in [RunState::Initialising]
    pub fn new(now: Instant, start_delay: Duration, stop_delay: Duration) -> Self {
        Self {
            state: RunState::Initialising,
            entered: now,
            start_delay,
            stop_delay,
        }
    }

    /// state reached by firing `trigger` in `state`, `None` if the trigger is not allowed there
    pub fn next(state: RunState, trigger: Trigger) -> Option<RunState> {
        use RunState::*;
        use Trigger::*;
        match (state, trigger) {
            (Initialising, Initialise) => Some(Idle),
            (Idle, Start) => Some(Starting),
            (Starting, StartCompleted) => Some(Running),
            (Running, Stop) => Some(Stopping),
            (Stopping, StopCompleted) => Some(Idle),
            (Aborted, Initialise) => Some(Idle),
            (Aborted, Abort) => None,
            (_, Abort) => Some(Aborted),
            _ => None,
        }
    }

    pub fn state(&self) -> RunState   {self.state}
    pub fn is_running(&self) -> bool   {self.state == RunState::Running}

    /// apply a trigger, a trigger not allowed in the current state is refused and changes nothing
    pub fn fire(&mut self, trigger: Trigger, now: Instant) -> EthercatResult<RunState> {
        let next = Self::next(self.state, trigger)
            .ok_or(EthercatError::Master("trigger not allowed in the current run state"))?;
        info!("{} -> {} on {:?}", self.state, next, trigger);
        self.state = next;
        self.entered = now;
        Ok(next)
    }

    /// complete a pending start or stop if its delay elapsed, returns the current state
    pub fn tick(&mut self, now: Instant) -> RunState {
        let elapsed = now.saturating_duration_since(self.entered);
        let completion = match self.state {
            RunState::Starting if elapsed >= self.start_delay => Some(Trigger::StartCompleted),
            RunState::Stopping if elapsed >= self.stop_delay => Some(Trigger::StopCompleted),
            _ => None,
        };
        if let Some(trigger) = completion {
            // always allowed in these states
            let _ = self.fire(trigger, now);
        }
        self.state
    }

    /**
        single button interface: starts when idle, stops when running

        Returns `None` when the button has no effect in the current state.
    */
    pub fn bump(&mut self, now: Instant) -> Option<RunState> {
        let trigger = match self.state {
            RunState::Idle => Trigger::Start,
            RunState::Running => Trigger::Stop,
            _ => return None,
        };
        self.fire(trigger, now).ok()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table() {
        use RunState::*;
        use Trigger::*;
        assert_eq!(Controller::next(Idle, Start), Some(Starting));
        assert_eq!(Controller::next(Idle, Stop), None);
        assert_eq!(Controller::next(Running, Start), None);
        assert_eq!(Controller::next(Starting, Abort), Some(Aborted));
        assert_eq!(Controller::next(Aborted, Abort), None);
        assert_eq!(Controller::next(Aborted, Initialise), Some(Idle));
    }

    #[test]
    fn lifecycle() {
        let start = Instant::now();
        let s = Duration::from_secs;
        let mut controller = Controller::new(start, s(2), s(2));
        assert!(controller.fire(Trigger::Start, start).is_err());
        assert_eq!(controller.fire(Trigger::Initialise, start).unwrap(), RunState::Idle);

        assert_eq!(controller.bump(start + s(1)), Some(RunState::Starting));
        assert_eq!(controller.bump(start + s(1)), None);
        assert_eq!(controller.tick(start + s(2)), RunState::Starting);
        assert_eq!(controller.tick(start + s(3)), RunState::Running);
        assert!(controller.is_running());

        assert_eq!(controller.bump(start + s(4)), Some(RunState::Stopping));
        assert_eq!(controller.tick(start + s(6)), RunState::Idle);

        controller.fire(Trigger::Abort, start + s(7)).unwrap();
        assert_eq!(controller.tick(start + s(100)), RunState::Aborted);
        assert_eq!(controller.bump(start + s(100)), None);
    }
}
