/// Best-accuracy bookkeeping for the primary model and its EMA shadow.
///
/// Pure state transitions, no I/O: the tracker decides when a checkpoint
/// write is warranted and the run controller acts on the signal. The two
/// tracks never influence each other.

/// Best accuracies observed so far; monotonically non-decreasing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestRecord {
    /// Best top-1 accuracy of the primary model
    pub primary: f64,
    /// Best top-1 accuracy of the EMA shadow, if it has been evaluated
    pub ema: Option<f64>,
}

/// Checkpoint write requested by the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveSignal {
    /// New best primary accuracy; persist under the `best` tag
    Best,
    /// New best EMA accuracy; persist under the `best-ema` tag
    BestEma,
}

/// Tracks strict improvements on both evaluation tracks
#[derive(Debug, Clone)]
pub struct BestTracker {
    record: BestRecord,
}

impl Default for BestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl BestTracker {
    pub fn new() -> Self {
        Self {
            record: BestRecord {
                primary: 0.0,
                ema: None,
            },
        }
    }

    /// Resume with previously observed bests
    pub fn with_record(record: BestRecord) -> Self {
        Self { record }
    }

    pub fn record(&self) -> BestRecord {
        self.record
    }

    /// Feed one primary-model accuracy; a strict improvement returns a save
    /// signal, ties and decreases return nothing
    pub fn observe_primary(&mut self, accuracy: f64) -> Option<SaveSignal> {
        if accuracy > self.record.primary {
            self.record.primary = accuracy;
            Some(SaveSignal::Best)
        } else {
            None
        }
    }

    /// Feed one EMA-shadow accuracy; independent of the primary track
    pub fn observe_ema(&mut self, accuracy: f64) -> Option<SaveSignal> {
        if accuracy > self.record.ema.unwrap_or(0.0) {
            self.record.ema = Some(accuracy);
            Some(SaveSignal::BestEma)
        } else {
            None
        }
    }
}
