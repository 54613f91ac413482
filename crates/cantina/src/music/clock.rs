//! Monotonic playback position clock.
//!
//! Advances position based on elapsed monotonic time, independent of the
//! audio device. Wall clock appears only in the `start_wall_clock` anchor
//! shared with consumers: while playing, `anchor = wall_now - position`, so
//! any consumer computes position as `now - anchor` without knowing pause
//! history. Resume re-anchors accordingly.

use std::time::Duration;

use tokio::time::Instant;

/// Tracks the current track's playback position.
///
/// When playing, the clock stores the instant play (or resume) happened and
/// the position at that moment; current position is that base plus elapsed
/// monotonic time. Pausing freezes the position.
pub struct PlaybackClock {
    /// When play/resume was pressed (None if paused/stopped)
    started: Option<Instant>,
    /// Position when play/resume was pressed
    base_position: Duration,
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            started: None,
            base_position: Duration::ZERO,
        }
    }

    /// Start playing from the beginning.
    pub fn start(&mut self) {
        self.base_position = Duration::ZERO;
        self.started = Some(Instant::now());
    }

    /// Resume (or seek-start) from an explicit position.
    pub fn start_at(&mut self, position: Duration) {
        self.base_position = position;
        self.started = Some(Instant::now());
    }

    /// Freeze the position. Returns the pause offset.
    pub fn pause(&mut self) -> Duration {
        let position = self.position();
        self.base_position = position;
        self.started = None;
        position
    }

    /// Stop and reset to zero.
    pub fn stop(&mut self) {
        self.started = None;
        self.base_position = Duration::ZERO;
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    /// Current position.
    pub fn position(&self) -> Duration {
        match self.started {
            Some(started) => self.base_position + started.elapsed(),
            None => self.base_position,
        }
    }

    /// Wall-clock anchor such that `wall_now - anchor = position`.
    ///
    /// Recomputed from the live position, so it stays valid across
    /// pause/resume cycles without consumers tracking pause history.
    pub fn wall_anchor(&self) -> f64 {
        cantinaproto::wall_clock_secs() - self.position().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn position_advances_while_playing() {
        let mut clock = PlaybackClock::new();
        clock.start();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(clock.position(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_freezes_position() {
        let mut clock = PlaybackClock::new();
        clock.start();
        tokio::time::sleep(Duration::from_secs(30)).await;

        let offset = clock.pause();
        assert_eq!(offset, Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(clock.position(), Duration::from_secs(30));
        assert!(!clock.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_continues_from_offset() {
        let mut clock = PlaybackClock::new();
        clock.start();
        tokio::time::sleep(Duration::from_secs(30)).await;
        let offset = clock.pause();
        tokio::time::sleep(Duration::from_secs(10)).await;

        clock.start_at(offset);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(clock.position(), Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_resets() {
        let mut clock = PlaybackClock::new();
        clock.start();
        tokio::time::sleep(Duration::from_secs(5)).await;
        clock.stop();
        assert_eq!(clock.position(), Duration::ZERO);
        assert!(!clock.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn anchor_tracks_position() {
        let mut clock = PlaybackClock::new();
        clock.start();
        tokio::time::sleep(Duration::from_secs(12)).await;

        let anchor = clock.wall_anchor();
        let implied = cantinaproto::wall_clock_secs() - anchor;
        assert!((implied - 12.0).abs() < 0.05);
    }
}
