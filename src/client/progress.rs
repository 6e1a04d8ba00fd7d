//! Upload progress reporting

use parking_lot::{Mutex, RwLock};

/// Stage of an upload, in the order they are entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Hashing,
    Initializing,
    Uploading,
    Completing,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hashing => "hashing",
            Self::Initializing => "initializing",
            Self::Uploading => "uploading",
            Self::Completing => "completing",
        }
    }
}

/// A progress notification
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub uploaded_chunks: usize,
    pub total_chunks: usize,
    /// Fraction of chunks held by the server, in `[0, 1]`
    pub progress: f64,
}

/// Callback invoked with upload progress.
pub type ProgressCallback = Box<dyn Fn(ProgressEvent) + Send + Sync>;

/// Emits progress events whose `progress` never decreases
pub(crate) struct ProgressReporter {
    callback: RwLock<Option<ProgressCallback>>,
    high_water: Mutex<f64>,
}

impl ProgressReporter {
    pub(crate) fn new() -> Self {
        Self {
            callback: RwLock::new(None),
            high_water: Mutex::new(0.0),
        }
    }

    pub(crate) fn set_callback(&self, callback: ProgressCallback) {
        *self.callback.write() = Some(callback);
    }

    /// Forget the high-water mark (new file)
    pub(crate) fn reset(&self) {
        *self.high_water.lock() = 0.0;
    }

    pub(crate) fn current(&self) -> f64 {
        *self.high_water.lock()
    }

    pub(crate) fn report(&self, phase: Phase, uploaded_chunks: usize, total_chunks: usize) {
        let raw = if total_chunks == 0 {
            if phase == Phase::Completing { 1.0 } else { 0.0 }
        } else {
            uploaded_chunks as f64 / total_chunks as f64
        };

        let progress = {
            let mut high_water = self.high_water.lock();
            *high_water = high_water.max(raw.clamp(0.0, 1.0));
            *high_water
        };

        tracing::trace!(
            phase = phase.as_str(),
            uploaded_chunks = uploaded_chunks,
            total_chunks = total_chunks,
            progress = progress,
            "Upload progress"
        );

        if let Some(cb) = self.callback.read().as_ref() {
            cb(ProgressEvent {
                phase,
                uploaded_chunks,
                total_chunks,
                progress,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_progress_never_decreases() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let reporter = ProgressReporter::new();
        let sink = seen.clone();
        reporter.set_callback(Box::new(move |e| sink.lock().push(e.progress)));

        reporter.report(Phase::Uploading, 2, 4);
        reporter.report(Phase::Uploading, 1, 4);
        reporter.report(Phase::Uploading, 3, 4);

        assert_eq!(*seen.lock(), vec![0.5, 0.5, 0.75]);
        assert_eq!(reporter.current(), 0.75);

        reporter.reset();
        reporter.report(Phase::Hashing, 0, 0);
        assert_eq!(seen.lock().last().copied(), Some(0.0));
    }
}
