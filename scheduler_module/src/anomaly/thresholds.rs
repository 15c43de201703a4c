use serde::Serialize;

pub const ROLLING_WINDOW_HOURS: i64 = 24;

/// Traffic bucket selecting which thresholds apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeTier {
    VeryLow,
    LowMedium,
    Medium,
    High,
}

impl VolumeTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeTier::VeryLow => "VERY_LOW",
            VolumeTier::LowMedium => "LOW_MEDIUM",
            VolumeTier::Medium => "MEDIUM",
            VolumeTier::High => "HIGH",
        }
    }
}

/// `None` below 5 emails: too little traffic to judge.
pub fn volume_tier(total_sent: u32) -> Option<VolumeTier> {
    match total_sent {
        0..=4 => None,
        5..=19 => Some(VolumeTier::VeryLow),
        20..=99 => Some(VolumeTier::LowMedium),
        100..=499 => Some(VolumeTier::Medium),
        _ => Some(VolumeTier::High),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdConfig {
    /// Zero makes the warning count-only.
    pub warning_rate_percent: f64,
    pub warning_min_count: u32,
    pub pause_rate_percent: f64,
    pub pause_min_count: u32,
}

impl ThresholdConfig {
    const fn new(warning_rate: f64, warning_min: u32, pause_rate: f64, pause_min: u32) -> Self {
        Self {
            warning_rate_percent: warning_rate,
            warning_min_count: warning_min,
            pause_rate_percent: pause_rate,
            pause_min_count: pause_min,
        }
    }

    pub fn should_pause(&self, rate_percent: f64, count: u32) -> bool {
        rate_percent >= self.pause_rate_percent && count >= self.pause_min_count
    }

    pub fn should_warn(&self, rate_percent: f64, count: u32) -> bool {
        if self.warning_rate_percent == 0.0 {
            return count >= self.warning_min_count;
        }
        rate_percent >= self.warning_rate_percent && count >= self.warning_min_count
    }
}

pub fn bounce_thresholds(tier: VolumeTier) -> ThresholdConfig {
    match tier {
        VolumeTier::VeryLow => ThresholdConfig::new(0.0, 2, 40.0, 3),
        VolumeTier::LowMedium => ThresholdConfig::new(5.0, 2, 8.0, 4),
        VolumeTier::Medium => ThresholdConfig::new(3.0, 3, 5.0, 10),
        VolumeTier::High => ThresholdConfig::new(2.5, 10, 4.0, 25),
    }
}

pub fn unsubscribe_thresholds(tier: VolumeTier) -> ThresholdConfig {
    match tier {
        VolumeTier::VeryLow => ThresholdConfig::new(0.0, 2, 20.0, 3),
        VolumeTier::LowMedium => ThresholdConfig::new(1.0, 4, 2.0, 7),
        VolumeTier::Medium => ThresholdConfig::new(0.8, 10, 1.5, 25),
        VolumeTier::High => ThresholdConfig::new(0.7, 30, 1.5, 50),
    }
}
