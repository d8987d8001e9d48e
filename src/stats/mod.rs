pub mod average_meter;
pub mod running_stats;

pub use average_meter::AverageMeter;
pub use running_stats::{Observation, RunningStats};
