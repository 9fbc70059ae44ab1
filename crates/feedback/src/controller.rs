use std::collections::HashMap;

use derive_more::Display;

use crate::backend::ContainerSignals;
use crate::FeedbackError;
use crate::Result;

/// Value stored in the recent-kernel counter to suspend all dispatch.
pub const BLOCKED_SENTINEL: i32 = -1;

/// Activity counts per device UUID, indexed by priority tier.
///
/// Built fresh every tick. The tier vector grows to the highest tier seen on
/// each device.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActivityAggregate {
    per_device: HashMap<String, Vec<u32>>,
}

impl ActivityAggregate {
    fn record(&mut self, uuid: &str, tier: usize) {
        let counts = self.per_device.entry(uuid.to_string()).or_default();
        if counts.len() <= tier {
            counts.resize(tier + 1, 0);
        }
        counts[tier] += 1;
    }

    /// Number of active containers of `tier` on `uuid`.
    pub fn count(&self, uuid: &str, tier: usize) -> u32 {
        self.per_device
            .get(uuid)
            .and_then(|counts| counts.get(tier))
            .copied()
            .unwrap_or(0)
    }

    /// Whether any tier strictly above `tier` was active on `uuid`.
    pub fn higher_tier_active(&self, uuid: &str, tier: usize) -> bool {
        self.per_device.get(uuid).is_some_and(|counts| {
            counts
                .iter()
                .take(tier)
                .any(|&count| count > 0)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.per_device.is_empty()
    }
}

/// A control field transition written during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SignalChange {
    #[display("blocked")]
    Blocked,
    #[display("unblocked")]
    Unblocked,
    #[display("contention on")]
    ContentionOn,
    #[display("contention off")]
    ContentionOff,
}

/// Outcome of one controller tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Containers that went through both passes
    pub observed: usize,
    /// Containers whose region could not be accessed this tick
    pub skipped: usize,
    /// Transitions as `(container index, change)`
    pub changes: Vec<(usize, SignalChange)>,
    pub aggregate: ActivityAggregate,
}

#[derive(Debug)]
struct Observation {
    tier: usize,
    devices: Vec<String>,
}

/// Two-pass priority arbiter over a set of containers.
#[derive(Debug, Default)]
pub struct FeedbackController {
    ticks: u64,
}

impl FeedbackController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ticks run so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Runs one tick over `containers`.
    ///
    /// The aggregate is completed over every container before any signal is
    /// decided. A container whose backend fails is logged and left out of
    /// the tick; the rest are still processed.
    pub fn tick<C: ContainerSignals>(&mut self, containers: &mut [C]) -> TickReport {
        self.ticks += 1;
        let mut report = TickReport::default();

        let mut observations = Vec::with_capacity(containers.len());
        for container in containers.iter_mut() {
            match age_container(container, &mut report.aggregate) {
                Ok(observation) => observations.push(Some(observation)),
                Err(err) => {
                    tracing::warn!(
                        container = %container.label(),
                        "skipping container for this tick: {err:?}"
                    );
                    report.skipped += 1;
                    observations.push(None);
                }
            }
        }

        for (idx, (container, observation)) in
            containers.iter_mut().zip(&observations).enumerate()
        {
            let Some(observation) = observation else {
                continue;
            };
            match apply_signals(container, observation, &report.aggregate) {
                Ok(changes) => {
                    report.observed += 1;
                    for change in changes {
                        tracing::info!(
                            container = %container.label(),
                            tier = observation.tier,
                            "{change}"
                        );
                        report.changes.push((idx, change));
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        container = %container.label(),
                        "failed to write signals: {err:?}"
                    );
                    report.skipped += 1;
                }
            }
        }

        if !report.changes.is_empty() {
            tracing::debug!(tick = self.ticks, aggregate = ?report.aggregate, "feedback tick");
        }
        report
    }
}

fn tier_of(priority: i32) -> usize {
    usize::try_from(priority).unwrap_or(0)
}

/// First pass: decrement the counter and record activity that is still live.
fn age_container<C: ContainerSignals>(
    container: &mut C,
    aggregate: &mut ActivityAggregate,
) -> Result<Observation, FeedbackError> {
    let tier = tier_of(container.priority()?);
    let devices = container.device_uuids()?;
    let recent = container.recent_kernel()?;

    if recent > 0 {
        let remaining = recent - 1;
        container.set_recent_kernel(remaining)?;
        if remaining > 0 {
            for uuid in &devices {
                aggregate.record(uuid, tier);
            }
        }
    }

    Ok(Observation { tier, devices })
}

/// Second pass: derive blocking and contention from the finished aggregate.
fn apply_signals<C: ContainerSignals>(
    container: &mut C,
    observation: &Observation,
    aggregate: &ActivityAggregate,
) -> Result<Vec<SignalChange>, FeedbackError> {
    let tier = observation.tier;
    let blocking = observation
        .devices
        .iter()
        .any(|uuid| aggregate.higher_tier_active(uuid, tier));
    let contention = blocking
        || observation
            .devices
            .iter()
            .any(|uuid| aggregate.count(uuid, tier) > 1);

    let mut changes = Vec::new();

    let recent = container.recent_kernel()?;
    if blocking && recent >= 0 {
        container.set_recent_kernel(BLOCKED_SENTINEL)?;
        changes.push(SignalChange::Blocked);
    } else if !blocking && recent < 0 {
        container.set_recent_kernel(0)?;
        changes.push(SignalChange::Unblocked);
    }

    let wanted = i32::from(contention);
    if container.utilization_switch()? != wanted {
        container.set_utilization_switch(wanted)?;
        changes.push(if contention {
            SignalChange::ContentionOn
        } else {
            SignalChange::ContentionOff
        });
    }

    Ok(changes)
}

#[cfg(test)]
mod tests {
    use error_stack::report;
    use similar_asserts::assert_eq;

    use super::*;

    #[derive(Debug, Default)]
    struct MockContainer {
        name: String,
        priority: i32,
        devices: Vec<String>,
        recent_kernel: i32,
        utilization_switch: i32,
        switch_writes: usize,
        broken: bool,
    }

    impl MockContainer {
        fn new(name: &str, priority: i32, devices: &[&str], recent_kernel: i32) -> Self {
            Self {
                name: name.to_string(),
                priority,
                devices: devices.iter().map(|d| d.to_string()).collect(),
                recent_kernel,
                ..Default::default()
            }
        }
    }

    impl ContainerSignals for MockContainer {
        fn label(&self) -> String {
            self.name.clone()
        }

        fn priority(&self) -> Result<i32, FeedbackError> {
            if self.broken {
                return Err(report!(FeedbackError::storage("region vanished")));
            }
            Ok(self.priority)
        }

        fn device_uuids(&self) -> Result<Vec<String>, FeedbackError> {
            Ok(self.devices.clone())
        }

        fn recent_kernel(&self) -> Result<i32, FeedbackError> {
            Ok(self.recent_kernel)
        }

        fn set_recent_kernel(&mut self, value: i32) -> Result<(), FeedbackError> {
            self.recent_kernel = value;
            Ok(())
        }

        fn utilization_switch(&self) -> Result<i32, FeedbackError> {
            Ok(self.utilization_switch)
        }

        fn set_utilization_switch(&mut self, value: i32) -> Result<(), FeedbackError> {
            self.switch_writes += 1;
            self.utilization_switch = value;
            Ok(())
        }
    }

    #[test_log::test]
    fn higher_tier_activity_blocks_lower_tier() {
        let mut containers = vec![
            MockContainer::new("high", 0, &["GPU-D"], 3),
            MockContainer::new("low", 1, &["GPU-D"], 3),
        ];

        let report = FeedbackController::new().tick(&mut containers);

        assert_eq!(containers[0].recent_kernel, 2);
        assert_eq!(containers[0].utilization_switch, 0);
        assert_eq!(containers[1].recent_kernel, BLOCKED_SENTINEL);
        assert_eq!(containers[1].utilization_switch, 1);
        assert_eq!(
            report.changes,
            vec![(1, SignalChange::Blocked), (1, SignalChange::ContentionOn)]
        );
    }

    #[test]
    fn same_tier_tenants_signal_contention_without_blocking() {
        let mut containers = vec![
            MockContainer::new("a", 1, &["GPU-D"], 3),
            MockContainer::new("b", 1, &["GPU-D"], 3),
        ];

        FeedbackController::new().tick(&mut containers);

        for container in &containers {
            assert_eq!(container.recent_kernel, 2);
            assert_eq!(container.utilization_switch, 1);
        }
    }

    #[test]
    fn counter_reaching_zero_counts_as_inactive() {
        let mut containers = vec![
            MockContainer::new("high", 0, &["GPU-D"], 1),
            MockContainer::new("low", 1, &["GPU-D"], 3),
        ];

        let report = FeedbackController::new().tick(&mut containers);

        assert_eq!(containers[0].recent_kernel, 0);
        assert_eq!(report.aggregate.count("GPU-D", 0), 0);
        assert_eq!(containers[1].recent_kernel, 2);
        assert_eq!(containers[1].utilization_switch, 0);
    }

    #[test]
    fn every_higher_tier_blocks_every_lower_tier() {
        for high in 0..4 {
            for low in (high + 1)..5 {
                let mut containers = vec![
                    MockContainer::new("low", low, &["GPU-D"], 5),
                    MockContainer::new("high", high, &["GPU-D"], 5),
                ];
                FeedbackController::new().tick(&mut containers);
                assert_eq!(
                    containers[0].recent_kernel, BLOCKED_SENTINEL,
                    "tier {high} should block tier {low}"
                );
                assert_eq!(containers[1].recent_kernel, 4);
            }
        }
    }

    #[test]
    fn blocked_container_is_released_once_higher_tier_goes_idle() {
        let mut containers = vec![
            MockContainer::new("high", 0, &["GPU-D"], 0),
            MockContainer::new("low", 1, &["GPU-D"], BLOCKED_SENTINEL),
        ];
        containers[1].utilization_switch = 1;

        let report = FeedbackController::new().tick(&mut containers);

        assert_eq!(containers[1].recent_kernel, 0);
        assert_eq!(containers[1].utilization_switch, 0);
        assert_eq!(
            report.changes,
            vec![(1, SignalChange::Unblocked), (1, SignalChange::ContentionOff)]
        );
    }

    #[test]
    fn blocked_container_does_not_feed_the_aggregate() {
        let mut containers = vec![
            MockContainer::new("low", 1, &["GPU-D"], BLOCKED_SENTINEL),
            MockContainer::new("peer", 1, &["GPU-D"], 3),
        ];

        let report = FeedbackController::new().tick(&mut containers);

        assert_eq!(report.aggregate.count("GPU-D", 1), 1);
        assert_eq!(containers[0].recent_kernel, 0);
        assert_eq!(containers[1].utilization_switch, 0);
    }

    #[test]
    fn blocking_considers_every_device_of_the_container() {
        let mut containers = vec![
            MockContainer::new("high", 0, &["GPU-B"], 4),
            MockContainer::new("low", 1, &["GPU-A", "GPU-B"], 4),
        ];

        FeedbackController::new().tick(&mut containers);

        assert_eq!(containers[1].recent_kernel, BLOCKED_SENTINEL);
    }

    #[test]
    fn tenants_on_different_devices_do_not_interact() {
        let mut containers = vec![
            MockContainer::new("high", 0, &["GPU-A"], 4),
            MockContainer::new("low", 1, &["GPU-B"], 4),
            MockContainer::new("idle", 2, &[], 4),
        ];

        let report = FeedbackController::new().tick(&mut containers);

        assert_eq!(containers[1].recent_kernel, 3);
        assert_eq!(containers[2].recent_kernel, 3);
        assert!(report.changes.is_empty());
    }

    #[test]
    fn negative_priority_is_treated_as_top_tier() {
        let mut containers = vec![
            MockContainer::new("odd", -3, &["GPU-D"], 4),
            MockContainer::new("low", 1, &["GPU-D"], 4),
        ];

        let report = FeedbackController::new().tick(&mut containers);

        assert_eq!(report.aggregate.count("GPU-D", 0), 1);
        assert_eq!(containers[0].recent_kernel, 3);
        assert_eq!(containers[1].recent_kernel, BLOCKED_SENTINEL);
    }

    #[test]
    fn unreadable_container_is_skipped_for_the_tick() {
        let mut broken = MockContainer::new("broken", 0, &["GPU-D"], 4);
        broken.broken = true;
        let mut containers = vec![broken, MockContainer::new("low", 1, &["GPU-D"], 4)];

        let report = FeedbackController::new().tick(&mut containers);

        assert_eq!(report.skipped, 1);
        assert_eq!(report.observed, 1);
        assert_eq!(containers[0].recent_kernel, 4);
        assert_eq!(containers[1].recent_kernel, 3);
    }

    #[test]
    fn utilization_switch_is_written_only_on_change() {
        let mut containers = vec![
            MockContainer::new("a", 1, &["GPU-D"], 10),
            MockContainer::new("b", 1, &["GPU-D"], 10),
        ];
        let mut controller = FeedbackController::new();

        controller.tick(&mut containers);
        controller.tick(&mut containers);
        controller.tick(&mut containers);

        assert_eq!(controller.ticks(), 3);
        assert_eq!(containers[0].switch_writes, 1);
        assert_eq!(containers[1].switch_writes, 1);
        assert_eq!(containers[0].recent_kernel, 7);
    }

    #[test]
    fn works_over_borrowed_containers() {
        let mut high = MockContainer::new("high", 0, &["GPU-D"], 3);
        let mut low = MockContainer::new("low", 1, &["GPU-D"], 3);
        let mut borrowed: Vec<&mut MockContainer> = vec![&mut high, &mut low];

        FeedbackController::new().tick(&mut borrowed);

        assert_eq!(low.recent_kernel, BLOCKED_SENTINEL);
        assert_eq!(high.recent_kernel, 2);
    }
}
