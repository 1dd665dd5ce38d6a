use chrono::Local;
use std::path::PathBuf;
use tensorboard_rs::summary_writer::SummaryWriter;

/// TensorBoard scalar logger for training runs.
pub struct TensorBoardLogger {
    writer: SummaryWriter,
    step: usize,
}

impl TensorBoardLogger {
    /// Logs are written to `runs/{timestamp}`.
    pub fn new() -> Self {
        let timestamp = Local::now().format("%Y%m%d-%H%M%S");
        Self::with_log_dir(&format!("runs/{}", timestamp))
    }

    pub fn with_log_dir(log_dir: &str) -> Self {
        let path = PathBuf::from(log_dir);
        Self {
            writer: SummaryWriter::new(&path),
            step: 0,
        }
    }

    /// Record `loss` for the current step and advance.
    pub fn log_loss(&mut self, loss: f32) {
        self.writer.add_scalar("train/loss", loss, self.step);
        self.step += 1;
    }

    pub fn log_epoch_loss(&mut self, epoch: usize, loss: f32) {
        self.writer.add_scalar("train/epoch_loss", loss, epoch);
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn flush(&mut self) {
        self.writer.flush();
    }
}

impl Default for TensorBoardLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TensorBoardLogger {
    fn drop(&mut self) {
        self.writer.flush();
    }
}
