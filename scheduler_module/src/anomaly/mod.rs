//! Rolling-window deliverability checks and the automatic pause they drive.

mod auto_pause;
mod detection;
mod notification;
mod thresholds;

pub use auto_pause::{AnomalyAction, AnomalySweep, AutoPauseService};
pub use detection::{AnomalyDetector, AnomalyMetrics, AnomalyResult};
pub use thresholds::{
    bounce_thresholds, unsubscribe_thresholds, volume_tier, ThresholdConfig, VolumeTier,
    ROLLING_WINDOW_HOURS,
};
