use serde::Serialize;
use std::time::Duration;

pub const FOCUS_SECONDS: u32 = 25 * 60;
pub const BREAK_SECONDS: u32 = 5 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PomodoroMode {
    Focus,
    Break,
}

impl PomodoroMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Focus => "focus",
            Self::Break => "break",
        }
    }

    pub fn next(self) -> Self {
        match self {
            Self::Focus => Self::Break,
            Self::Break => Self::Focus,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Running { remaining: u32 },
    /// The given mode ran out; the timer has already switched to the next one.
    Finished(PomodoroMode),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PomodoroTimer {
    mode: PomodoroMode,
    remaining: u32,
    running: bool,
    focus_seconds: u32,
    break_seconds: u32,
}

impl Default for PomodoroTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PomodoroTimer {
    pub fn new() -> Self {
        Self::with_durations(FOCUS_SECONDS, BREAK_SECONDS)
    }

    /// Zero durations are raised to one second.
    pub fn with_durations(focus_seconds: u32, break_seconds: u32) -> Self {
        let focus_seconds = focus_seconds.max(1);
        Self {
            mode: PomodoroMode::Focus,
            remaining: focus_seconds,
            running: false,
            focus_seconds,
            break_seconds: break_seconds.max(1),
        }
    }

    pub fn mode(&self) -> PomodoroMode {
        self.mode
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn duration_of(&self, mode: PomodoroMode) -> u32 {
        match mode {
            PomodoroMode::Focus => self.focus_seconds,
            PomodoroMode::Break => self.break_seconds,
        }
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn pause(&mut self) {
        self.running = false;
    }

    pub fn toggle(&mut self) {
        self.running = !self.running;
    }

    /// Stops and refills the current mode.
    pub fn reset(&mut self) {
        self.running = false;
        self.remaining = self.duration_of(self.mode);
    }

    /// Advances one second.
    pub fn tick(&mut self) -> TickOutcome {
        if !self.running {
            return TickOutcome::Idle;
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining > 0 {
            return TickOutcome::Running {
                remaining: self.remaining,
            };
        }
        let finished = self.mode;
        self.running = false;
        self.mode = finished.next();
        self.remaining = self.duration_of(self.mode);
        tracing::info!(finished = finished.as_str(), next = self.mode.as_str(), "pomodoro phase finished");
        TickOutcome::Finished(finished)
    }

    /// `MM:SS` of the remaining time.
    pub fn display(&self) -> String {
        format!("{:02}:{:02}", self.remaining / 60, self.remaining % 60)
    }
}

/// Ticks a started timer every `period` until the current phase ends.
/// Returns the mode that finished, or `None` if the timer was not running.
pub async fn run_phase(timer: &mut PomodoroTimer, period: Duration) -> Option<PomodoroMode> {
    if !timer.is_running() {
        return None;
    }
    let mut interval = tokio::time::interval(period);
    // The first tick of an interval completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        match timer.tick() {
            TickOutcome::Finished(mode) => return Some(mode),
            TickOutcome::Running { .. } => {}
            TickOutcome::Idle => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{run_phase, PomodoroMode, PomodoroTimer, TickOutcome, BREAK_SECONDS, FOCUS_SECONDS};
    use std::time::Duration;

    #[test]
    fn starts_idle_in_focus_mode() {
        let mut timer = PomodoroTimer::new();
        assert_eq!(timer.mode(), PomodoroMode::Focus);
        assert_eq!(timer.remaining(), FOCUS_SECONDS);
        assert_eq!(timer.display(), "25:00");
        assert_eq!(timer.tick(), TickOutcome::Idle);
        assert_eq!(timer.remaining(), FOCUS_SECONDS);
    }

    #[test]
    fn focus_rolls_over_into_break() {
        let mut timer = PomodoroTimer::with_durations(2, 1);
        timer.start();
        assert_eq!(timer.tick(), TickOutcome::Running { remaining: 1 });
        assert_eq!(timer.tick(), TickOutcome::Finished(PomodoroMode::Focus));
        assert_eq!(timer.mode(), PomodoroMode::Break);
        assert_eq!(timer.remaining(), 1);
        assert!(!timer.is_running());

        timer.toggle();
        assert_eq!(timer.tick(), TickOutcome::Finished(PomodoroMode::Break));
        assert_eq!(timer.mode(), PomodoroMode::Focus);
        assert_eq!(timer.remaining(), 2);
    }

    #[test]
    fn pause_and_reset() {
        let mut timer = PomodoroTimer::new();
        timer.start();
        timer.tick();
        timer.pause();
        assert_eq!(timer.tick(), TickOutcome::Idle);
        assert_eq!(timer.display(), "24:59");

        timer.reset();
        assert!(!timer.is_running());
        assert_eq!(timer.remaining(), FOCUS_SECONDS);
        assert_eq!(timer.duration_of(PomodoroMode::Break), BREAK_SECONDS);
    }

    #[tokio::test]
    async fn run_phase_drives_to_completion() {
        let mut timer = PomodoroTimer::with_durations(3, 1);
        assert_eq!(run_phase(&mut timer, Duration::from_millis(1)).await, None);

        timer.start();
        let finished = tokio::time::timeout(Duration::from_secs(2), run_phase(&mut timer, Duration::from_millis(1)))
            .await
            .expect("phase in time");
        assert_eq!(finished, Some(PomodoroMode::Focus));
        assert_eq!(timer.mode(), PomodoroMode::Break);
    }
}
