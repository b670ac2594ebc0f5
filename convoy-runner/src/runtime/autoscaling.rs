//! Autoscaling policy
//!
//! Two independent target-tracking loops, one per [`MetricDimension`]. Each
//! averages the samples inside its window and recommends
//! `ceil(current * average / target)`; a loop with no samples does not vote.
//! The effective count is the largest recommendation, clamped to the
//! capacity bounds, so a bound violation cannot be expressed at all.
//! Committing a scaling event empties both windows: samples taken at the old
//! task count do not describe the new one.

use chrono::{DateTime, TimeDelta, Utc};
use convoy_core::domain::environment::RuntimeParameters;
use convoy_core::domain::runtime::{
    MetricDimension, MetricSample, ScalingDecision, ScalingOutcome,
};
use std::collections::VecDeque;
use std::time::Duration;

use super::AutoscalingSettings;

#[derive(Debug, Clone)]
struct ScalingLoop {
    target: f64,
    samples: VecDeque<MetricSample>,
}

impl ScalingLoop {
    fn new(target: f64) -> Self {
        Self {
            target,
            samples: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: DateTime<Utc>, window: TimeDelta) {
        self.samples
            .retain(|sample| now.signed_duration_since(sample.observed_at) <= window);
    }

    fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let total: f64 = self.samples.iter().map(|sample| sample.utilization).sum();
        Some(total / self.samples.len() as f64)
    }

    fn recommend(&self, current: u32) -> Option<u32> {
        self.average()
            .map(|average| (current as f64 * average / self.target).ceil() as u32)
    }
}

/// Target-tracking autoscaling over CPU and memory
#[derive(Debug, Clone)]
pub struct AutoscalingPolicy {
    cpu: ScalingLoop,
    memory: ScalingLoop,
    min_capacity: u32,
    max_capacity: u32,
    settings: AutoscalingSettings,
    last_scale_up: Option<DateTime<Utc>>,
    last_scaling: Option<DateTime<Utc>>,
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

impl AutoscalingPolicy {
    pub fn new(parameters: &RuntimeParameters, settings: AutoscalingSettings) -> Self {
        Self {
            cpu: ScalingLoop::new(parameters.cpu_target),
            memory: ScalingLoop::new(parameters.memory_target),
            min_capacity: parameters.min_capacity,
            max_capacity: parameters.max_capacity,
            settings,
            last_scale_up: None,
            last_scaling: None,
        }
    }

    /// Replaces bounds and targets; recorded samples are kept
    pub fn configure(&mut self, parameters: &RuntimeParameters) {
        self.cpu.target = parameters.cpu_target;
        self.memory.target = parameters.memory_target;
        self.min_capacity = parameters.min_capacity;
        self.max_capacity = parameters.max_capacity;
    }

    pub fn bounds(&self) -> (u32, u32) {
        (self.min_capacity, self.max_capacity)
    }

    pub fn targets(&self) -> (f64, f64) {
        (self.cpu.target, self.memory.target)
    }

    pub fn clamp(&self, count: u32) -> u32 {
        count.clamp(self.min_capacity, self.max_capacity)
    }

    /// Adds a sample and drops everything that fell out of the window
    pub fn record(&mut self, sample: MetricSample) {
        let window = to_delta(self.settings.window);
        match sample.dimension {
            MetricDimension::Cpu => self.cpu.samples.push_back(sample),
            MetricDimension::Memory => self.memory.samples.push_back(sample),
        }
        self.cpu.prune(sample.observed_at, window);
        self.memory.prune(sample.observed_at, window);
    }

    /// Decides the desired count for `current` at time `now`
    ///
    /// Pure with respect to the policy: nothing changes until the decision is
    /// committed.
    pub fn decide(&self, current: u32, now: DateTime<Utc>) -> ScalingDecision {
        let cpu_recommendation = self.cpu.recommend(current);
        let memory_recommendation = self.memory.recommend(current);

        let wanted = match cpu_recommendation.max(memory_recommendation) {
            Some(recommended) => self.clamp(recommended),
            None => self.clamp(current),
        };

        let outcome = if wanted > current {
            if self.elapsed(self.last_scale_up, self.settings.scale_up_cooldown, now) {
                ScalingOutcome::ScaledUp
            } else {
                ScalingOutcome::CoolingDown
            }
        } else if wanted < current {
            if self.elapsed(self.last_scaling, self.settings.scale_down_cooldown, now) {
                ScalingOutcome::ScaledDown
            } else {
                ScalingOutcome::CoolingDown
            }
        } else {
            ScalingOutcome::Unchanged
        };

        ScalingDecision {
            previous: current,
            desired: if outcome == ScalingOutcome::CoolingDown {
                current
            } else {
                wanted
            },
            cpu_recommendation,
            memory_recommendation,
            outcome,
        }
    }

    /// Records that a decision was applied, starting its cooldown
    pub fn commit(&mut self, decision: &ScalingDecision, at: DateTime<Utc>) {
        match decision.outcome {
            ScalingOutcome::ScaledUp => {
                self.last_scale_up = Some(at);
                self.last_scaling = Some(at);
            }
            ScalingOutcome::ScaledDown => self.last_scaling = Some(at),
            _ => return,
        }
        self.cpu.samples.clear();
        self.memory.samples.clear();
    }

    fn elapsed(&self, since: Option<DateTime<Utc>>, cooldown: Duration, now: DateTime<Utc>) -> bool {
        match since {
            Some(at) => now.signed_duration_since(at) >= to_delta(cooldown),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parameters() -> RuntimeParameters {
        RuntimeParameters {
            desired_count: 1,
            min_capacity: 1,
            max_capacity: 4,
            cpu_target: 50.0,
            memory_target: 50.0,
        }
    }

    fn sample(dimension: MetricDimension, utilization: f64, at: DateTime<Utc>) -> MetricSample {
        MetricSample {
            dimension,
            utilization,
            observed_at: at,
        }
    }

    fn short_window() -> AutoscalingSettings {
        AutoscalingSettings {
            window: Duration::from_secs(10),
            scale_up_cooldown: Duration::from_secs(60),
            scale_down_cooldown: Duration::from_secs(300),
        }
    }

    #[test]
    fn test_cpu_recommendation_wins_and_is_clamped() {
        let now = Utc::now();
        let mut policy = AutoscalingPolicy::new(&parameters(), AutoscalingSettings::default());
        policy.record(sample(MetricDimension::Cpu, 80.0, now));
        policy.record(sample(MetricDimension::Memory, 30.0, now));

        let decision = policy.decide(1, now);
        assert_eq!(decision.cpu_recommendation, Some(2));
        assert_eq!(decision.memory_recommendation, Some(1));
        assert_eq!(decision.desired, 2);
        assert_eq!(decision.outcome, ScalingOutcome::ScaledUp);

        let decision = policy.decide(4, now);
        assert_eq!(decision.cpu_recommendation, Some(7));
        assert_eq!(decision.desired, 4);
        assert_eq!(decision.outcome, ScalingOutcome::Unchanged);
    }

    #[test]
    fn test_loop_without_samples_does_not_vote() {
        let now = Utc::now();
        let mut policy = AutoscalingPolicy::new(&parameters(), AutoscalingSettings::default());
        policy.record(sample(MetricDimension::Memory, 30.0, now));

        let decision = policy.decide(4, now);
        assert_eq!(decision.cpu_recommendation, None);
        assert_eq!(decision.memory_recommendation, Some(3));
        assert_eq!(decision.desired, 3);
        assert_eq!(decision.outcome, ScalingOutcome::ScaledDown);
    }

    #[test]
    fn test_no_samples_keeps_current() {
        let policy = AutoscalingPolicy::new(&parameters(), AutoscalingSettings::default());
        let decision = policy.decide(2, Utc::now());
        assert_eq!(decision.desired, 2);
        assert_eq!(decision.outcome, ScalingOutcome::Unchanged);
    }

    #[test]
    fn test_samples_outside_window_are_dropped() {
        let start = Utc::now();
        let mut policy = AutoscalingPolicy::new(&parameters(), short_window());
        policy.record(sample(MetricDimension::Cpu, 100.0, start));
        policy.record(sample(MetricDimension::Cpu, 50.0, start + TimeDelta::seconds(11)));

        let decision = policy.decide(2, start + TimeDelta::seconds(11));
        assert_eq!(decision.cpu_recommendation, Some(2));
        assert_eq!(decision.outcome, ScalingOutcome::Unchanged);
    }

    #[test]
    fn test_scale_up_cooldown() {
        let start = Utc::now();
        let mut policy = AutoscalingPolicy::new(&parameters(), short_window());

        policy.record(sample(MetricDimension::Cpu, 80.0, start));
        let first = policy.decide(1, start);
        assert_eq!(first.outcome, ScalingOutcome::ScaledUp);
        policy.commit(&first, start);

        let later = start + TimeDelta::seconds(30);
        policy.record(sample(MetricDimension::Cpu, 90.0, later));
        let blocked = policy.decide(2, later);
        assert_eq!(blocked.outcome, ScalingOutcome::CoolingDown);
        assert_eq!(blocked.desired, 2);

        let after = start + TimeDelta::seconds(61);
        policy.record(sample(MetricDimension::Cpu, 90.0, after));
        let allowed = policy.decide(2, after);
        assert_eq!(allowed.outcome, ScalingOutcome::ScaledUp);
        assert_eq!(allowed.desired, 4);
    }

    #[test]
    fn test_scale_down_waits_for_longer_cooldown() {
        let start = Utc::now();
        let mut policy = AutoscalingPolicy::new(&parameters(), short_window());

        policy.record(sample(MetricDimension::Cpu, 80.0, start));
        let up = policy.decide(1, start);
        policy.commit(&up, start);

        let quiet = start + TimeDelta::seconds(120);
        policy.record(sample(MetricDimension::Cpu, 10.0, quiet));
        let blocked = policy.decide(2, quiet);
        assert_eq!(blocked.outcome, ScalingOutcome::CoolingDown);
        assert_eq!(blocked.desired, 2);

        let later = start + TimeDelta::seconds(301);
        policy.record(sample(MetricDimension::Cpu, 10.0, later));
        let down = policy.decide(2, later);
        assert_eq!(down.outcome, ScalingOutcome::ScaledDown);
        assert_eq!(down.desired, 1);
    }

    #[test]
    fn test_samples_from_before_scale_up_do_not_vote() {
        let start = Utc::now();
        let mut wide = parameters();
        wide.max_capacity = 10;
        let mut policy = AutoscalingPolicy::new(&wide, AutoscalingSettings::default());

        policy.record(sample(MetricDimension::Cpu, 80.0, start));
        let up = policy.decide(1, start);
        assert_eq!(up.desired, 2);
        assert_eq!(up.outcome, ScalingOutcome::ScaledUp);
        policy.commit(&up, start);

        let later = start + TimeDelta::seconds(61);
        policy.record(sample(MetricDimension::Cpu, 40.0, later));
        let decision = policy.decide(2, later);
        assert_eq!(decision.cpu_recommendation, Some(2));
        assert_eq!(decision.desired, 2);
        assert_eq!(decision.outcome, ScalingOutcome::Unchanged);
    }

    #[test]
    fn test_unchanged_commit_keeps_samples() {
        let now = Utc::now();
        let mut policy = AutoscalingPolicy::new(&parameters(), AutoscalingSettings::default());
        policy.record(sample(MetricDimension::Cpu, 50.0, now));

        let steady = policy.decide(2, now);
        assert_eq!(steady.outcome, ScalingOutcome::Unchanged);
        policy.commit(&steady, now);

        assert_eq!(policy.decide(2, now).cpu_recommendation, Some(2));
    }

    #[test]
    fn test_configure_changes_bounds() {
        let now = Utc::now();
        let mut policy = AutoscalingPolicy::new(&parameters(), AutoscalingSettings::default());
        policy.record(sample(MetricDimension::Cpu, 80.0, now));

        let mut wider = parameters();
        wider.max_capacity = 10;
        policy.configure(&wider);

        assert_eq!(policy.bounds(), (1, 10));
        assert_eq!(policy.decide(4, now).desired, 7);
    }
}
