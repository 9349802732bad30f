//! Pacing of the network phase and the cooperative pause.

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info};

use crate::envelope::UiEvent;
use crate::error::Result;

pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionState {
    pub paused: bool,
    pub realtime: bool,
    pub rendering: bool,
    pub last_step: Option<Instant>,
    pub frame_budget: Duration,
}

/// Outcome of pacing one tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pacing {
    Skip,
    /// Talk to the viewer; the push stands for `frames` ticks.
    Push { frames: u32 },
}

/// Session-control events reported by the viewer under reserved ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlToggle {
    Pause(bool),
    Realtime(bool),
    Render(bool),
}

impl ControlToggle {
    pub fn from_event(event: &UiEvent) -> Option<Self> {
        let flag = |default: bool| match &event.value {
            Value::Bool(flag) => *flag,
            Value::Number(number) => number.as_f64().is_some_and(|value| value != 0.0),
            _ => default,
        };
        match event.element_id.as_str() {
            "pause" => Some(Self::Pause(flag(true))),
            "unpause" | "resume" => Some(Self::Pause(false)),
            "realtime" => Some(Self::Realtime(flag(true))),
            "render" => Some(Self::Render(flag(true))),
            _ => None,
        }
    }
}

/// Polls the viewer while paused.
pub trait PausePoll {
    /// One round trip to the viewer; returns the control toggles it reported.
    fn poll(&mut self) -> Result<Vec<ControlToggle>>;
    /// Waits up to `timeout` for the viewer to report something unprompted.
    fn wait(&mut self, timeout: Duration) -> Result<Vec<ControlToggle>>;
}

pub struct RenderLoop<C: Clock = SystemClock> {
    state: SessionState,
    clock: C,
    skipped: u32,
    wake_interval: Duration,
}

impl RenderLoop<SystemClock> {
    pub fn new(frame_budget: Duration, realtime: bool, wake_interval: Duration) -> Self {
        Self::with_clock(SystemClock, frame_budget, realtime, wake_interval)
    }
}

impl<C: Clock> RenderLoop<C> {
    pub fn with_clock(clock: C, frame_budget: Duration, realtime: bool, wake_interval: Duration) -> Self {
        Self {
            state: SessionState {
                paused: false,
                realtime,
                rendering: true,
                last_step: None,
                frame_budget,
            },
            clock,
            skipped: 1,
            wake_interval,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn set_rendering(&mut self, rendering: bool) {
        self.state.rendering = rendering;
    }

    /// Ticks folded into the next push so far.
    pub fn skipped(&self) -> u32 {
        self.skipped
    }

    /// Decides whether this tick talks to the viewer.
    ///
    /// In real-time mode the loop sleeps so that wall time keeps up with
    /// `dt` times the ticks since the last push, and skips the push when it
    /// is already behind. Otherwise pushes are throttled to the frame budget.
    pub fn pace(&mut self, dt: f64) -> Pacing {
        let Some(last) = self.state.last_step else {
            return self.push();
        };
        let elapsed = self.clock.now().saturating_duration_since(last);
        if self.state.realtime {
            // A target past what `Duration` holds cannot be slept out.
            let Ok(target) = Duration::try_from_secs_f64((dt * f64::from(self.skipped)).max(0.0))
            else {
                return self.push();
            };
            if elapsed > target {
                self.skipped += 1;
                return Pacing::Skip;
            }
            self.clock.sleep(target - elapsed);
        } else if elapsed < self.state.frame_budget {
            self.skipped += 1;
            return Pacing::Skip;
        }
        self.push()
    }

    fn push(&mut self) -> Pacing {
        let frames = self.skipped;
        self.skipped = 1;
        self.state.last_step = Some(self.clock.now());
        Pacing::Push { frames }
    }

    pub fn apply(&mut self, toggle: ControlToggle) {
        match toggle {
            ControlToggle::Pause(paused) => {
                if paused != self.state.paused {
                    info!("{}", if paused { "paused by viewer" } else { "resumed by viewer" });
                }
                self.state.paused = paused;
            }
            ControlToggle::Realtime(realtime) => {
                debug!("realtime set to {realtime}");
                self.state.realtime = realtime;
                self.state.last_step = None;
            }
            ControlToggle::Render(rendering) => {
                info!("rendering {}", if rendering { "enabled" } else { "disabled" });
                self.state.rendering = rendering;
                self.state.last_step = None;
            }
        }
    }

    pub fn apply_all(&mut self, toggles: impl IntoIterator<Item = ControlToggle>) {
        for toggle in toggles {
            self.apply(toggle);
        }
    }

    /// Blocks while paused, polling the viewer once per cycle and waiting
    /// on its events in between. Returns the number of polls made.
    pub fn hold_while_paused<P: PausePoll>(&mut self, poller: &mut P) -> Result<u32> {
        let mut polls = 0;
        while self.state.paused {
            let toggles = poller.poll()?;
            polls += 1;
            self.apply_all(toggles);
            if !self.state.paused {
                break;
            }
            let toggles = poller.wait(self.wake_interval)?;
            self.apply_all(toggles);
        }
        if polls > 0 {
            // Time spent paused must not count as a missed frame.
            self.state.last_step = None;
            self.skipped = 1;
        }
        Ok(polls)
    }
}
