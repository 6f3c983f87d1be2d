use std::time::{Duration, Instant};

use crate::task::ProgressInfo;

/// Tracks the transferred bytes of one runner and rate-limits the reports
pub struct ProgressTracker {
    /// possible None if the total size is unknown
    total: Option<u64>,
    downloaded: u64,
    interval: Duration,
    last_report: Instant,
    last_downloaded: u64,
    speed: u64,
}

impl ProgressTracker {
    /// `offset` is the size already on disk, it does not count towards the speed
    pub fn new(offset: u64, total: Option<u64>, interval: Duration) -> Self {
        Self::new_at(offset, total, interval, Instant::now())
    }

    fn new_at(offset: u64, total: Option<u64>, interval: Duration, now: Instant) -> Self {
        Self {
            total,
            downloaded: offset,
            interval,
            last_report: now,
            last_downloaded: offset,
            speed: 0,
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// Record `len` more bytes, returns a report once per interval
    pub fn advance(&mut self, len: u64) -> Option<ProgressInfo> {
        self.advance_at(len, Instant::now())
    }

    fn advance_at(&mut self, len: u64, now: Instant) -> Option<ProgressInfo> {
        self.downloaded += len;
        let elapsed = now.saturating_duration_since(self.last_report);
        if elapsed < self.interval || elapsed.is_zero() {
            return None;
        }
        let delta = self.downloaded - self.last_downloaded;
        self.speed = (delta as f64 / elapsed.as_secs_f64()) as u64;
        self.last_report = now;
        self.last_downloaded = self.downloaded;
        Some(self.snapshot())
    }

    pub fn snapshot(&self) -> ProgressInfo {
        let progress = match self.total {
            Some(total) if total > 0 => (self.downloaded as f64 / total as f64 * 100.0).min(100.0),
            _ => 0.0,
        };
        let remaining_time = match self.total {
            Some(total) if self.speed > 0 => Some(total.saturating_sub(self.downloaded) / self.speed),
            _ => None,
        };
        ProgressInfo {
            progress,
            speed: self.speed,
            total_size: self.total.unwrap_or(0),
            downloaded_size: self.downloaded,
            remaining_time,
        }
    }

    /// The final report, sent right before the completion message
    pub fn finish(&self) -> ProgressInfo {
        ProgressInfo {
            progress: 100.0,
            speed: self.speed,
            total_size: self.total.unwrap_or(self.downloaded),
            downloaded_size: self.downloaded,
            remaining_time: Some(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_log::test;

    #[test]
    fn test_reports_are_rate_limited() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new_at(0, Some(1000), Duration::from_secs(1), start);
        assert_eq!(tracker.advance_at(100, start + Duration::from_millis(300)), None);
        assert_eq!(tracker.advance_at(100, start + Duration::from_millis(600)), None);
        let report = tracker
            .advance_at(200, start + Duration::from_secs(2))
            .unwrap();
        assert_eq!(report.downloaded_size, 400);
        assert_eq!(report.speed, 200);
        assert_eq!(report.progress, 40.0);
        assert_eq!(report.remaining_time, Some(3));
        assert_eq!(tracker.advance_at(10, start + Duration::from_millis(2500)), None);
    }

    #[test]
    fn test_resumed_offset_is_not_speed() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new_at(400, Some(1000), Duration::from_secs(1), start);
        let report = tracker.advance_at(100, start + Duration::from_secs(1)).unwrap();
        assert_eq!(report.speed, 100);
        assert_eq!(report.progress, 50.0);
    }

    #[test]
    fn test_unknown_total() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new_at(0, None, Duration::from_secs(1), start);
        let report = tracker.advance_at(500, start + Duration::from_secs(1)).unwrap();
        assert_eq!(report.progress, 0.0);
        assert_eq!(report.remaining_time, None);
        let finished = tracker.finish();
        assert_eq!(finished.progress, 100.0);
        assert_eq!(finished.total_size, 500);
    }
}
