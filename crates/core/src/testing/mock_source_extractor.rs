//! Mock source extractor for testing.
//!
//! Detection runs on the blocking pool, so this mock uses `std::sync` locks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::detection::{DetectionError, DetectionReport, SourceDetector};
use crate::input::SourceImage;

/// Mock implementation of the SourceDetector trait.
///
/// Returns a fixed report for every image, or a configured failure.
#[derive(Debug, Default)]
pub struct MockSourceExtractor {
    report: RwLock<DetectionReport>,
    failure: RwLock<Option<String>>,
    panic: RwLock<bool>,
    calls: AtomicUsize,
}

impl MockSourceExtractor {
    pub fn new(report: DetectionReport) -> Self {
        Self {
            report: RwLock::new(report),
            ..Default::default()
        }
    }

    pub fn set_report(&self, report: DetectionReport) {
        *self.report.write().unwrap_or_else(PoisonError::into_inner) = report;
    }

    /// Fail every call with an invalid-image error.
    pub fn set_failure(&self, message: &str) {
        *self.failure.write().unwrap_or_else(PoisonError::into_inner) = Some(message.to_string());
    }

    pub fn set_panic(&self, panic: bool) {
        *self.panic.write().unwrap_or_else(PoisonError::into_inner) = panic;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SourceDetector for MockSourceExtractor {
    fn detect(&self, _image: &SourceImage) -> Result<DetectionReport, DetectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let panic = *self.panic.read().unwrap_or_else(PoisonError::into_inner);
        if panic {
            panic!("mock source extractor panicked");
        }

        if let Some(message) = self
            .failure
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(DetectionError::InvalidImage(message));
        }

        Ok(self
            .report
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}
