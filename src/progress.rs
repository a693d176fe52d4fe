//! Run progress reporting.
//!
//! A run reports through a [`ProgressSink`] with four fire-and-forget callbacks.
//! [`ProgressTracker`] owns the per-run counters and builds each [`ProgressEvent`].

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub operation: String,
    pub current_file: String,
    pub status: String,
    pub processed_files: usize,
    pub total_files: usize,
    pub processed_bytes: u64,
    pub total_bytes: u64,
    pub percentage: f64,
    pub elapsed: Duration,
    pub estimated_remaining: Option<Duration>,
    pub active: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ProgressEvent {
    pub fn elapsed_display(&self) -> String {
        format_duration(self.elapsed)
    }

    pub fn eta_display(&self) -> String {
        match self.estimated_remaining {
            Some(eta) => format_duration(eta),
            None => "Calculating...".to_string(),
        }
    }
}

/// Receiver of run progress. Implementations must not block the run.
pub trait ProgressSink: Send + Sync {
    fn on_start(&self, event: &ProgressEvent);
    fn on_update(&self, event: &ProgressEvent);
    fn on_finish(&self, event: &ProgressEvent);
    fn on_error(&self, event: &ProgressEvent);
}

/// Discards every event.
impl ProgressSink for () {
    fn on_start(&self, _: &ProgressEvent) {}
    fn on_update(&self, _: &ProgressEvent) {}
    fn on_finish(&self, _: &ProgressEvent) {}
    fn on_error(&self, _: &ProgressEvent) {}
}

/// Writes progress as tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_start(&self, event: &ProgressEvent) {
        info!(
            operation = %event.operation,
            files = event.total_files,
            bytes = event.total_bytes,
            "transfer started"
        );
    }

    fn on_update(&self, event: &ProgressEvent) {
        info!(
            file = %event.current_file,
            status = %event.status,
            progress = format!("{}/{}", event.processed_files, event.total_files),
            percent = format!("{:.1}", event.percentage),
            eta = %event.eta_display(),
            "file processed"
        );
    }

    fn on_finish(&self, event: &ProgressEvent) {
        info!(
            operation = %event.operation,
            files = event.processed_files,
            bytes = event.processed_bytes,
            elapsed = %event.elapsed_display(),
            "transfer finished"
        );
    }

    fn on_error(&self, event: &ProgressEvent) {
        tracing::error!(operation = %event.operation, elapsed = %event.elapsed_display(), "transfer failed");
    }
}

/// `Ns` under a minute, `Nm Ns` under an hour, `Nh Nm` beyond.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Per-run progress counters.
pub struct ProgressTracker<'a> {
    sink: &'a dyn ProgressSink,
    operation: String,
    current_file: String,
    total_files: usize,
    processed_files: usize,
    total_bytes: u64,
    processed_bytes: u64,
    started: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    finished_elapsed: Option<Duration>,
    active: bool,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(sink: &'a dyn ProgressSink) -> Self {
        Self {
            sink,
            operation: "Idle".to_string(),
            current_file: String::new(),
            total_files: 0,
            processed_files: 0,
            total_bytes: 0,
            processed_bytes: 0,
            started: None,
            started_at: None,
            ended_at: None,
            finished_elapsed: None,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn start(&mut self, total_files: usize, total_bytes: u64, operation: &str) {
        self.operation = operation.to_string();
        self.current_file.clear();
        self.total_files = total_files;
        self.processed_files = 0;
        self.total_bytes = total_bytes;
        self.processed_bytes = 0;
        self.started = Some(Instant::now());
        self.started_at = Some(Utc::now());
        self.ended_at = None;
        self.finished_elapsed = None;
        self.active = true;
        let event = self.event(String::new());
        self.sink.on_start(&event);
    }

    pub fn update(&mut self, file: &str, status: &str, file_size: u64) {
        self.current_file = file.to_string();
        self.processed_files += 1;
        self.processed_bytes += file_size;
        let event = self.event(status.to_string());
        self.sink.on_update(&event);
    }

    pub fn finish(&mut self, message: &str) {
        self.stop();
        self.operation = message.to_string();
        self.current_file.clear();
        let event = self.event("Finished".to_string());
        self.sink.on_finish(&event);
    }

    pub fn error(&mut self, message: &str) {
        self.stop();
        self.operation = format!("Error: {message}");
        let event = self.event("Error".to_string());
        self.sink.on_error(&event);
    }

    fn stop(&mut self) {
        self.finished_elapsed = Some(self.elapsed());
        self.ended_at = Some(Utc::now());
        self.active = false;
    }

    fn elapsed(&self) -> Duration {
        self.finished_elapsed
            .or_else(|| self.started.map(|s| s.elapsed()))
            .unwrap_or_default()
    }

    fn percentage(&self) -> f64 {
        if self.total_files == 0 {
            return 0.0;
        }
        self.processed_files as f64 / self.total_files as f64 * 100.0
    }

    /// Extrapolates the files-per-second rate seen so far.
    fn estimated_remaining(&self) -> Option<Duration> {
        if !self.active || self.processed_files == 0 {
            return None;
        }
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let rate = self.processed_files as f64 / elapsed;
        let remaining = self.total_files.saturating_sub(self.processed_files) as f64;
        Some(Duration::from_secs_f64(remaining / rate))
    }

    fn event(&self, status: String) -> ProgressEvent {
        ProgressEvent {
            operation: self.operation.clone(),
            current_file: self.current_file.clone(),
            status,
            processed_files: self.processed_files,
            total_files: self.total_files,
            processed_bytes: self.processed_bytes,
            total_bytes: self.total_bytes,
            percentage: self.percentage(),
            elapsed: self.elapsed(),
            estimated_remaining: self.estimated_remaining(),
            active: self.active,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(&'static str, ProgressEvent)>>);

    impl ProgressSink for Recorder {
        fn on_start(&self, e: &ProgressEvent) {
            self.0.lock().unwrap().push(("start", e.clone()));
        }
        fn on_update(&self, e: &ProgressEvent) {
            self.0.lock().unwrap().push(("update", e.clone()));
        }
        fn on_finish(&self, e: &ProgressEvent) {
            self.0.lock().unwrap().push(("finish", e.clone()));
        }
        fn on_error(&self, e: &ProgressEvent) {
            self.0.lock().unwrap().push(("error", e.clone()));
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(7_380)), "2h 3m");
    }

    #[test]
    fn test_tracker_lifecycle() {
        let recorder = Recorder::default();
        let mut tracker = ProgressTracker::new(&recorder);
        assert!(!tracker.is_active());
        tracker.start(4, 400, "DC_TO_DR");
        assert!(tracker.is_active());
        tracker.update("a.txt", "Transferred", 100);
        tracker.update("b.txt", "Unchanged", 100);
        tracker.finish("Transfer completed successfully");
        assert!(!tracker.is_active());

        let events = recorder.0.lock().unwrap();
        let kinds: Vec<_> = events.iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec!["start", "update", "update", "finish"]);

        let (_, second) = &events[2];
        assert_eq!(second.processed_files, 2);
        assert_eq!(second.processed_bytes, 200);
        assert!((second.percentage - 50.0).abs() < 1e-9);
        assert!(second.active);

        let (_, done) = &events[3];
        assert!(!done.active);
        assert!(done.ended_at.is_some());
        assert!(done.estimated_remaining.is_none());
        assert_eq!(done.operation, "Transfer completed successfully");
    }

    #[test]
    fn test_tracker_error_event() {
        let recorder = Recorder::default();
        let mut tracker = ProgressTracker::new(&recorder);
        tracker.start(0, 0, "DR_TO_DC");
        tracker.error("disk on fire");

        let events = recorder.0.lock().unwrap();
        let (kind, event) = events.last().unwrap();
        assert_eq!(*kind, "error");
        assert_eq!(event.operation, "Error: disk on fire");
        assert_eq!(event.percentage, 0.0);
    }
}
