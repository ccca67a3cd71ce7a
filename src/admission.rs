/// Default ceiling on concurrent transfers.
pub const DEFAULT_MAX_RUNNING: usize = 50;

/// Gate on ingestion: another line is read only while there is room for one
/// more transfer, so the in-flight count never passes the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    ceiling: usize,
}

impl Admission {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling: ceiling.max(1),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn is_admitting(&self, in_flight: usize) -> bool {
        in_flight < self.ceiling
    }
}

impl Default for Admission {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RUNNING)
    }
}
