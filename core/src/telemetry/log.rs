use log::{debug, info, warn};

/// Stage-scoped logger; every line is prefixed with the stage name.
pub struct LogManager {
    stage: &'static str,
}

impl LogManager {
    pub fn new(stage: &'static str) -> Self {
        Self { stage }
    }

    pub fn record(&self, message: &str) {
        info!("[{}] {}", self.stage, message);
    }

    pub fn detail(&self, message: &str) {
        debug!("[{}] {}", self.stage, message);
    }

    pub fn caution(&self, message: &str) {
        warn!("[{}] {}", self.stage, message);
    }
}
