/*!
    small logic blocks for the application cycle, like found in PLC libraries

    Every block is a plain state machine stepped by the caller, usually once per cycle, with the current time when it matters. None of them spawns a task or arms a timer.
*/

use std::time::{Duration, Instant};
use log::debug;


/// detects a transition of a boolean from false to true
#[derive(Copy, Clone, Debug, Default)]
pub struct RisingEdge {
    last: bool,
}
impl RisingEdge {
    pub fn new() -> Self   {Self::default()}
    /// give the current value, returns true if it was false at the previous run
    pub fn run(&mut self, value: bool) -> bool {
        let edge = ! self.last && value;
        self.last = value;
        edge
    }
}

/// detects a transition of a boolean from true to false
#[derive(Copy, Clone, Debug, Default)]
pub struct FallingEdge {
    last: bool,
}
impl FallingEdge {
    pub fn new() -> Self   {Self::default()}
    /// give the current value, returns true if it was true at the previous run
    pub fn run(&mut self, value: bool) -> bool {
        let edge = self.last && ! value;
        self.last = value;
        edge
    }
}


/**
    detects a given number of clicks, each one closer than `window` to the previous one

    ```
    use std::time::{Duration, Instant};
    use etherplc::plc::MultiClick;

    let start = Instant::now();
    let mut double = MultiClick::new(2, Duration::from_millis(300));
    double.click(start);
    double.click(start + Duration::from_millis(200));
    assert!(double.tick(start + Duration::from_millis(210)));
    assert!(! double.tick(start + Duration::from_millis(220)));
    ```
*/
#[derive(Copy, Clone, Debug)]
pub struct MultiClick {
    count: u8,
    window: Duration,
    state: ClickState,
    /// the count was reached and not yet reported by [Self::tick]
    clicked: bool,
}
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ClickState {
    Idle,
    Partial {clicks: u8, last: Instant},
}
impl MultiClick {
    pub fn new(count: u8, window: Duration) -> Self {
        Self {
            count: count.max(1),
            window,
            state: ClickState::Idle,
            clicked: false,
        }
    }
    /// register a click
    pub fn click(&mut self, now: Instant) {
        let clicks = match self.state {
            ClickState::Partial {clicks, last} if now.saturating_duration_since(last) <= self.window => clicks + 1,
            _ => 1,
        };
        if clicks >= self.count {
            debug!("{} clicks reached", clicks);
            self.clicked = true;
            self.state = ClickState::Idle;
        }
        else {
            self.state = ClickState::Partial {clicks, last: now};
        }
    }
    /// returns true once after the click count was reached, and forgets clicks older than the window
    pub fn tick(&mut self, now: Instant) -> bool {
        if let ClickState::Partial {last, ..} = self.state {
            if now.saturating_duration_since(last) > self.window {
                self.state = ClickState::Idle;
            }
        }
        core::mem::take(&mut self.clicked)
    }
    /// number of clicks registered in the current series
    pub fn clicks(&self) -> u8 {
        match self.state {
            ClickState::Idle => 0,
            ClickState::Partial {clicks, ..} => clicks,
        }
    }
}


/// automatic mode, with temporary manual periods that expire by themselves
#[derive(Copy, Clone, Debug)]
pub struct AutoManual {
    default_duration: Duration,
    /// end of the manual period, if any
    manual: Option<Instant>,
}
impl AutoManual {
    /// starts in automatic mode, `default_duration` is the manual period when none is given
    pub fn new(default_duration: Duration) -> Self {
        Self {default_duration, manual: None}
    }
    /**
        switch to manual mode for the given duration, or the default one

        Returns false and does nothing if already in manual mode.
    */
    pub fn start_manual(&mut self, now: Instant, duration: Option<Duration>) -> bool {
        if self.manual.is_some()
            {return false}
        let duration = duration.unwrap_or(self.default_duration);
        debug!("manual mode for {:?}", duration);
        self.manual = Some(now + duration);
        true
    }
    /// return to automatic mode immediately
    pub fn cancel_manual(&mut self) {
        self.manual = None;
    }
    /// return to automatic mode if the manual period is over
    pub fn tick(&mut self, now: Instant) {
        if self.manual.is_some_and(|end| now >= end) {
            debug!("manual mode expired");
            self.manual = None;
        }
    }
    pub fn is_automatic(&self) -> bool   {self.manual.is_none()}
    pub fn is_manual(&self) -> bool   {self.manual.is_some()}
}
