use std::time::Duration;

use tracing::warn;

use crate::warehouse::WarehouseClient;

#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    pub low_water: usize,
    pub high_water: usize,
    pub saturation: usize,
    pub step_delay: Duration,
    pub saturation_delay: Duration,
}

/// Computes the delay to sleep before the next load submission from the
/// warehouse's reported concurrent-job count.
///
/// The warehouse's admission control is the one hard ceiling in the whole
/// pipeline; it rejects submissions outright once saturated. The controller
/// reacts before submission, with a monotonically non-decreasing step
/// function of the reported load: free below the low-water mark, seconds-scale
/// steps between the marks, and a long pause at saturation. The count is an
/// eventually-consistent read, so at saturation it is read once more before
/// the caller proceeds.
pub struct AdmissionController {
    config: BackpressureConfig,
}

impl AdmissionController {
    pub fn new(config: BackpressureConfig) -> Self {
        Self { config }
    }

    /// The step function. Monotonic by construction: each tier's delay is at
    /// least the previous tier's, whatever the configured values.
    pub fn delay_for(&self, running: usize) -> Duration {
        let step = self.config.step_delay;
        let double_step = step.saturating_mul(2);
        let saturated = self.config.saturation_delay.max(double_step);

        if running < self.config.low_water {
            Duration::ZERO
        } else if running < self.config.high_water {
            step
        } else if running < self.config.saturation {
            double_step
        } else {
            saturated
        }
    }

    pub async fn admission_delay(&self, target: &dyn WarehouseClient) -> Duration {
        let first = match target.running_jobs().await {
            Ok(count) => count,
            Err(e) => {
                // Can't see the target's load: assume the worst and wait
                warn!("failed to read concurrent job count: {e}");
                return self.delay_for(self.config.saturation);
            }
        };

        let mut delay = self.delay_for(first);
        if first >= self.config.saturation {
            let second = match target.running_jobs().await {
                Ok(count) => count,
                Err(e) => {
                    warn!("failed to re-read concurrent job count: {e}");
                    self.config.saturation
                }
            };
            delay = delay.max(self.delay_for(second));
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::MockWarehouseClient;

    fn controller() -> AdmissionController {
        AdmissionController::new(BackpressureConfig {
            low_water: 8,
            high_water: 16,
            saturation: 24,
            step_delay: Duration::from_secs(5),
            saturation_delay: Duration::from_secs(30),
        })
    }

    #[test]
    fn test_zero_delay_below_low_water() {
        let controller = controller();
        for running in 0..8 {
            assert_eq!(controller.delay_for(running), Duration::ZERO);
        }
    }

    #[test]
    fn test_delay_is_monotonically_non_decreasing() {
        let controller = controller();
        let mut previous = Duration::ZERO;
        for running in 0..64 {
            let delay = controller.delay_for(running);
            assert!(
                delay >= previous,
                "delay decreased at {running} concurrent jobs"
            );
            previous = delay;
        }
    }

    #[test]
    fn test_step_tiers() {
        let controller = controller();
        assert_eq!(controller.delay_for(8), Duration::from_secs(5));
        assert_eq!(controller.delay_for(16), Duration::from_secs(10));
        assert_eq!(controller.delay_for(24), Duration::from_secs(30));
    }

    #[test]
    fn test_monotonic_even_with_small_saturation_delay() {
        let controller = AdmissionController::new(BackpressureConfig {
            low_water: 2,
            high_water: 4,
            saturation: 6,
            step_delay: Duration::from_secs(10),
            saturation_delay: Duration::from_secs(1),
        });
        assert_eq!(controller.delay_for(6), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_saturation_repeats_the_read() {
        let controller = controller();
        let warehouse = MockWarehouseClient::new();
        warehouse.push_running_jobs(30);
        warehouse.push_running_jobs(30);

        let delay = controller.admission_delay(&warehouse).await;
        assert_eq!(delay, Duration::from_secs(30));
        assert_eq!(warehouse.running_jobs_reads(), 2);
    }

    #[tokio::test]
    async fn test_below_saturation_reads_once() {
        let controller = controller();
        let warehouse = MockWarehouseClient::new();
        warehouse.push_running_jobs(10);

        let delay = controller.admission_delay(&warehouse).await;
        assert_eq!(delay, Duration::from_secs(5));
        assert_eq!(warehouse.running_jobs_reads(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_count_is_treated_as_saturation() {
        let controller = controller();
        let warehouse = MockWarehouseClient::new();
        warehouse.set_fail_running_jobs(true);

        let delay = controller.admission_delay(&warehouse).await;
        assert_eq!(delay, Duration::from_secs(30));
    }
}
