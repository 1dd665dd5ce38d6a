//! Console training progress line

use std::io::{self, Write};
use std::time::{Duration, Instant};

/// Rewrites a single status line while training runs.
pub struct TrainingProgress {
    num_epochs: usize,
    records_per_epoch: usize,
    current_epoch: usize,
    current_record: usize,
    started: Instant,
    enabled: bool,
}

impl TrainingProgress {
    pub fn new(num_epochs: usize, records_per_epoch: usize, enabled: bool) -> Self {
        Self {
            num_epochs,
            records_per_epoch,
            current_epoch: 0,
            current_record: 0,
            started: Instant::now(),
            enabled,
        }
    }

    pub fn start_epoch(&mut self) {
        self.current_epoch += 1;
        self.current_record = 0;
    }

    pub fn update_record(&mut self, loss: f32) {
        self.current_record += 1;
        if !self.enabled {
            return;
        }
        print!(
            "\r{} ms Epoch: {}/{} Record: {}/{} Loss: {:.6}",
            self.elapsed().as_millis(),
            self.current_epoch,
            self.num_epochs,
            self.current_record,
            self.records_per_epoch,
            loss
        );
        io::stdout().flush().ok();
    }

    /// Records seen so far in the current epoch.
    pub fn current_record(&self) -> usize {
        self.current_record
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn finish(&self) {
        if self.enabled {
            println!("\nTraining complete in {} ms", self.elapsed().as_millis());
        }
    }
}
