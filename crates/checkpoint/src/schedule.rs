//! Which epochs are checkpointed

use runtime_core::{config::ScheduleConfig, Epoch};

/// Save points are epochs `1, 1 + period, 1 + 2 * period, ...` up to
/// `total_epochs`; a run covers those at or after `start_epoch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveSchedule {
    pub start_epoch: Epoch,
    pub total_epochs: Epoch,
    pub save_period: Epoch,
}

impl SaveSchedule {
    pub fn new(start_epoch: Epoch, total_epochs: Epoch, save_period: Epoch) -> Self {
        Self {
            start_epoch: start_epoch.max(1),
            total_epochs,
            save_period: save_period.max(1),
        }
    }

    pub fn should_save(&self, epoch: Epoch) -> bool {
        epoch >= 1
            && epoch >= self.start_epoch
            && epoch <= self.total_epochs
            && (epoch - 1) % self.save_period == 0
    }

    /// Save points this run will hit
    pub fn save_points(&self) -> impl Iterator<Item = Epoch> + '_ {
        (1..=self.total_epochs)
            .step_by(self.save_period as usize)
            .filter(move |epoch| *epoch >= self.start_epoch)
    }

    pub fn save_count(&self) -> usize {
        self.save_points().count()
    }

    /// Schedule for a run resuming after `recovered_epoch`
    pub fn resume_from(&self, recovered_epoch: Epoch) -> Self {
        Self::new(
            recovered_epoch.saturating_add(1),
            self.total_epochs,
            self.save_period,
        )
    }
}

impl From<&ScheduleConfig> for SaveSchedule {
    fn from(config: &ScheduleConfig) -> Self {
        Self::new(config.start_epoch, config.total_epochs, config.save_period)
    }
}
