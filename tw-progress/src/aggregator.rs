//! Progress aggregation and availability
//!
//! Everything here is a pure function of the facts passed in: recomputing
//! with unchanged inputs always yields the same result. Percentages are
//! kept at full precision internally and rounded with [`round2`] only when
//! exposed.

use crate::config::SuspicionPolicy;
use crate::models::{Subsection, SubsectionProgress, TestDefinition, TestKind};
use crate::weights::WeightTable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tw_common::ProgressStatus;

/// Tolerance for threshold comparisons on accumulated floats
const EPSILON: f64 = 1e-9;

/// Round to two decimal places for exposure
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Negative or non-finite weights contribute nothing
fn effective_weight(weight: f64) -> f64 {
    if weight.is_finite() && weight > 0.0 {
        weight
    } else {
        0.0
    }
}

fn clamp_percentage(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn weighted_average(items: &[ItemContribution]) -> f64 {
    let (sum, total) = items
        .iter()
        .filter(|item| item.counts_toward_completion)
        .fold((0.0, 0.0), |(sum, total), item| {
            (sum + item.weight * item.score, total + item.weight)
        });
    if total > 0.0 {
        clamp_percentage(sum / total)
    } else {
        0.0
    }
}

/// Status implied by a percentage against the pass threshold
pub fn status_for(percentage: f64, threshold: f64) -> ProgressStatus {
    if percentage + EPSILON >= threshold {
        ProgressStatus::Completed
    } else if percentage > 0.0 {
        ProgressStatus::InProgress
    } else {
        ProgressStatus::Started
    }
}

/// Credit tracked time to a subsection row.
///
/// Completion is `effective_time / required_seconds` capped at 100, where
/// flagged time is left out under [`SuspicionPolicy::Exclude`]. Status only
/// moves forward, and a COMPLETED subsection stays at 100%.
#[allow(clippy::too_many_arguments)]
pub fn apply_time_credit(
    previous: Option<&SubsectionProgress>,
    user_id: i64,
    subsection_id: i64,
    credited_seconds: f64,
    flagged_seconds: f64,
    required_seconds: f64,
    policy: SuspicionPolicy,
    now: DateTime<Utc>,
) -> SubsectionProgress {
    let mut row = previous
        .cloned()
        .unwrap_or_else(|| SubsectionProgress::new(user_id, subsection_id));

    row.time_spent_seconds += credited_seconds.max(0.0);
    row.flagged_seconds = (row.flagged_seconds + flagged_seconds.max(0.0)).min(row.time_spent_seconds);
    row.last_activity_at = Some(now);

    let effective = match policy {
        SuspicionPolicy::FlagOnly => row.time_spent_seconds,
        SuspicionPolicy::Exclude => row.time_spent_seconds - row.flagged_seconds,
    };

    let (candidate, percentage) = if required_seconds <= 0.0 || effective + EPSILON >= required_seconds {
        (ProgressStatus::Completed, 100.0)
    } else if row.time_spent_seconds > 0.0 {
        (ProgressStatus::InProgress, effective / required_seconds * 100.0)
    } else {
        (ProgressStatus::Started, 0.0)
    };

    row.status = row.status.advance_to(candidate);
    row.completion_percentage = if row.status == ProgressStatus::Completed {
        100.0
    } else {
        clamp_percentage(percentage.max(row.completion_percentage))
    };
    if row.status == ProgressStatus::Completed && row.completed_at.is_none() {
        row.completed_at = Some(now);
    }
    row
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Subsection,
    Section,
    Test,
}

/// One item's share of its parent's completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemContribution {
    pub kind: ItemKind,
    pub id: i64,
    pub weight: f64,
    /// 0, 50 or 100 for subsections; 0 or 100 for tests
    pub score: f64,
    /// Hinted tests are shown but never gate progress
    pub counts_toward_completion: bool,
}

/// A subsection with the status the student has reached on it
#[derive(Debug, Clone, Copy)]
pub struct SubsectionFact<'a> {
    pub subsection: &'a Subsection,
    pub status: ProgressStatus,
}

/// A test with the student's best scored attempt
#[derive(Debug, Clone, Copy)]
pub struct TestFact<'a> {
    pub test: &'a TestDefinition,
    pub best_score: Option<f64>,
}

impl TestFact<'_> {
    pub fn passed(&self) -> bool {
        self.best_score
            .is_some_and(|score| score + EPSILON >= self.test.passing_score)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionComputation {
    pub section_id: i64,
    /// Weighted subsections plus section-final tests
    pub completion_percentage: f64,
    /// Weighted subsections only
    pub content_percentage: f64,
    pub status: ProgressStatus,
    pub passed: bool,
    /// Every section-final test has a passing attempt
    pub finals_passed: bool,
    pub items: Vec<ItemContribution>,
}

impl SectionComputation {
    pub fn gate(&self) -> SectionGate {
        SectionGate {
            section_id: self.section_id,
            passed: self.passed,
            finals_passed: self.finals_passed,
            content_percentage: self.content_percentage,
        }
    }
}

/// Section completion: weighted average of subsection scores
/// (0 STARTED / 50 IN_PROGRESS / 100 COMPLETED) and section-final test
/// results (100 passed / 0 otherwise).
///
/// A subsection's own weight overrides its content-type weight. Hinted
/// tests appear in `items` but do not count.
pub fn calculate_section_progress(
    section_id: i64,
    subsections: &[SubsectionFact<'_>],
    tests: &[TestFact<'_>],
    weights: &WeightTable,
    threshold: f64,
) -> SectionComputation {
    let mut items: Vec<ItemContribution> = subsections
        .iter()
        .map(|fact| ItemContribution {
            kind: ItemKind::Subsection,
            id: fact.subsection.id,
            weight: effective_weight(
                fact.subsection
                    .weight
                    .unwrap_or_else(|| weights.get(fact.subsection.kind.content_type(), 1.0)),
            ),
            score: fact.status.score(),
            counts_toward_completion: true,
        })
        .collect();

    let content_percentage = weighted_average(&items);

    for fact in tests {
        items.push(ItemContribution {
            kind: ItemKind::Test,
            id: fact.test.id,
            weight: effective_weight(weights.get(fact.test.kind.content_type(), 1.0)),
            score: if fact.passed() { 100.0 } else { 0.0 },
            counts_toward_completion: fact.test.kind == TestKind::SectionFinal,
        });
    }

    let completion_percentage = weighted_average(&items);
    let finals_passed = tests
        .iter()
        .filter(|fact| fact.test.kind == TestKind::SectionFinal)
        .all(|fact| fact.passed());

    SectionComputation {
        section_id,
        completion_percentage,
        content_percentage,
        status: status_for(completion_percentage, threshold),
        passed: completion_percentage + EPSILON >= threshold,
        finals_passed,
        items,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicComputation {
    pub topic_id: i64,
    pub completion_percentage: f64,
    pub status: ProgressStatus,
    pub passed: bool,
    pub items: Vec<ItemContribution>,
}

/// A section's weight and its computed completion
#[derive(Debug, Clone, Copy)]
pub struct SectionFact {
    pub section_id: i64,
    pub weight: f64,
    pub completion_percentage: f64,
}

/// Topic completion: sections weighted by their own weight plus
/// global-final tests weighted by the content-type table.
pub fn calculate_topic_progress(
    topic_id: i64,
    sections: &[SectionFact],
    global_tests: &[TestFact<'_>],
    weights: &WeightTable,
    threshold: f64,
) -> TopicComputation {
    let mut items: Vec<ItemContribution> = sections
        .iter()
        .map(|fact| ItemContribution {
            kind: ItemKind::Section,
            id: fact.section_id,
            weight: effective_weight(fact.weight),
            score: clamp_percentage(fact.completion_percentage),
            counts_toward_completion: true,
        })
        .collect();

    for fact in global_tests {
        items.push(ItemContribution {
            kind: ItemKind::Test,
            id: fact.test.id,
            weight: effective_weight(weights.get(fact.test.kind.content_type(), 1.0)),
            score: if fact.passed() { 100.0 } else { 0.0 },
            counts_toward_completion: fact.test.kind == TestKind::GlobalFinal,
        });
    }

    let completion_percentage = weighted_average(&items);
    TopicComputation {
        topic_id,
        completion_percentage,
        status: status_for(completion_percentage, threshold),
        passed: completion_percentage + EPSILON >= threshold,
        items,
    }
}

/// Per-section facts that gate tests and later sections
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SectionGate {
    pub section_id: i64,
    pub passed: bool,
    pub finals_passed: bool,
    pub content_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Availability {
    pub available: bool,
    pub reason: Option<String>,
}

impl Availability {
    fn open() -> Self {
        Self {
            available: true,
            reason: None,
        }
    }

    fn closed(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
        }
    }
}

/// Whether a test may be started, from current progress only.
///
/// - HINTED: always
/// - SECTION_FINAL: section content completion ≥ `required_completion`
///   (every subsection completed when unset)
/// - GLOBAL_FINAL: every section passed with its finals passed, and every
///   earlier global final of the topic (lower id) passed
pub fn check_test_availability(
    test: &TestDefinition,
    section: Option<&SectionGate>,
    topic_sections: &[SectionGate],
    earlier_global_finals_passed: bool,
) -> Availability {
    if test.is_archived {
        return Availability::closed("test is archived");
    }

    match test.kind {
        TestKind::Hinted => Availability::open(),
        TestKind::SectionFinal => {
            let Some(gate) = section else {
                return Availability::closed("test is not attached to an active section");
            };
            let required = test.required_completion.unwrap_or(100.0);
            if gate.content_percentage + EPSILON >= required {
                Availability::open()
            } else {
                Availability::closed(format!(
                    "section content {:.2}% complete, {:.2}% required",
                    round2(gate.content_percentage),
                    required
                ))
            }
        }
        TestKind::GlobalFinal => {
            if let Some(gate) = topic_sections.iter().find(|g| !g.passed) {
                return Availability::closed(format!("section {} not passed", gate.section_id));
            }
            if let Some(gate) = topic_sections.iter().find(|g| !g.finals_passed) {
                return Availability::closed(format!(
                    "final tests of section {} not passed",
                    gate.section_id
                ));
            }
            if !earlier_global_finals_passed {
                return Availability::closed("earlier global final tests not passed");
            }
            Availability::open()
        }
    }
}

/// Availability of each section, in topic order: the first is open, every
/// later one once its predecessor is passed with its finals passed
pub fn section_availability(sections: &[SectionGate]) -> Vec<bool> {
    let mut available = Vec::with_capacity(sections.len());
    for (i, _) in sections.iter().enumerate() {
        if i == 0 {
            available.push(true);
        } else {
            let prev = &sections[i - 1];
            available.push(prev.passed && prev.finals_passed);
        }
    }
    available
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentType, SubsectionKind};
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn subsection(id: i64, kind: SubsectionKind, weight: Option<f64>) -> Subsection {
        Subsection {
            id,
            section_id: 1,
            title: format!("sub {}", id),
            kind,
            position: id,
            min_time_seconds: None,
            weight,
            is_archived: false,
        }
    }

    fn test_def(id: i64, kind: TestKind, passing_score: f64) -> TestDefinition {
        TestDefinition {
            id,
            title: format!("test {}", id),
            kind,
            section_id: Some(1),
            topic_id: None,
            passing_score,
            required_completion: None,
            duration_minutes: Some(20),
            max_attempts: None,
            is_archived: false,
        }
    }

    #[test]
    fn test_weighted_section_average() {
        let a = subsection(1, SubsectionKind::Text, Some(2.0));
        let b = subsection(2, SubsectionKind::Text, Some(1.0));
        let facts = [
            SubsectionFact { subsection: &a, status: ProgressStatus::Completed },
            SubsectionFact { subsection: &b, status: ProgressStatus::Started },
        ];

        let result = calculate_section_progress(1, &facts, &[], &WeightTable::default(), 80.0);
        assert_eq!(round2(result.completion_percentage), 66.67);
        assert_eq!(result.status, ProgressStatus::InProgress);
        assert!(!result.passed);

        // Recomputing with the same inputs gives the same answer
        let again = calculate_section_progress(1, &facts, &[], &WeightTable::default(), 80.0);
        assert_eq!(result, again);
    }

    #[test]
    fn test_content_type_weights_apply_without_override() {
        let mut table = HashMap::new();
        table.insert(ContentType::SubsectionVideo, 3.0);
        let weights = WeightTable::new(table);

        let video = subsection(1, SubsectionKind::Video, None);
        let text = subsection(2, SubsectionKind::Text, None);
        let facts = [
            SubsectionFact { subsection: &video, status: ProgressStatus::InProgress },
            SubsectionFact { subsection: &text, status: ProgressStatus::Completed },
        ];

        // (3*50 + 1*100) / 4
        let result = calculate_section_progress(1, &facts, &[], &weights, 80.0);
        assert_eq!(result.completion_percentage, 62.5);
    }

    #[test]
    fn test_hinted_tests_do_not_count() {
        let a = subsection(1, SubsectionKind::Text, None);
        let hinted = test_def(10, TestKind::Hinted, 60.0);
        let facts = [SubsectionFact { subsection: &a, status: ProgressStatus::Completed }];
        let tests = [TestFact { test: &hinted, best_score: None }];

        let result = calculate_section_progress(1, &facts, &tests, &WeightTable::default(), 80.0);
        assert_eq!(result.completion_percentage, 100.0);
        assert_eq!(result.items.len(), 2);
        assert!(!result.items[1].counts_toward_completion);
        assert!(result.finals_passed);
    }

    #[test]
    fn test_section_final_counts_as_pass_or_fail() {
        let a = subsection(1, SubsectionKind::Text, None);
        let final_test = test_def(10, TestKind::SectionFinal, 60.0);
        let facts = [SubsectionFact { subsection: &a, status: ProgressStatus::Completed }];

        let failed = [TestFact { test: &final_test, best_score: Some(40.0) }];
        let result = calculate_section_progress(1, &facts, &failed, &WeightTable::default(), 80.0);
        assert_eq!(result.completion_percentage, 50.0);
        assert_eq!(result.content_percentage, 100.0);
        assert!(!result.finals_passed);

        let passed = [TestFact { test: &final_test, best_score: Some(60.0) }];
        let result = calculate_section_progress(1, &facts, &passed, &WeightTable::default(), 80.0);
        assert_eq!(result.completion_percentage, 100.0);
        assert!(result.passed && result.finals_passed);
    }

    #[test]
    fn test_percentage_bounded_for_odd_weights() {
        let statuses = [ProgressStatus::Completed, ProgressStatus::InProgress, ProgressStatus::Started];
        let weight_sets: [[Option<f64>; 3]; 5] = [
            [Some(1.0), Some(1.0), Some(1.0)],
            [Some(0.0), Some(0.0), Some(5.0)],
            [Some(0.0), Some(0.0), Some(0.0)],
            [Some(-4.0), Some(1.0), Some(1.0)],
            [Some(f64::INFINITY), Some(1e300), Some(f64::NAN)],
        ];

        for weights in weight_sets {
            let subs: Vec<Subsection> = weights
                .iter()
                .enumerate()
                .map(|(i, w)| subsection(i as i64, SubsectionKind::Text, *w))
                .collect();
            let facts: Vec<SubsectionFact> = subs
                .iter()
                .zip(statuses)
                .map(|(s, status)| SubsectionFact { subsection: s, status })
                .collect();

            let result = calculate_section_progress(1, &facts, &[], &WeightTable::default(), 80.0);
            assert!(
                (0.0..=100.0).contains(&result.completion_percentage),
                "{:?} gave {}",
                weights,
                result.completion_percentage
            );
        }
    }

    #[test]
    fn test_topic_combines_sections_and_global_final() {
        let global = TestDefinition {
            section_id: None,
            topic_id: Some(1),
            ..test_def(20, TestKind::GlobalFinal, 70.0)
        };
        let sections = [
            SectionFact { section_id: 1, weight: 1.0, completion_percentage: 100.0 },
            SectionFact { section_id: 2, weight: 1.0, completion_percentage: 50.0 },
        ];

        let none = calculate_topic_progress(1, &sections, &[TestFact { test: &global, best_score: None }], &WeightTable::default(), 80.0);
        assert_eq!(none.completion_percentage, 50.0);

        let passed = calculate_topic_progress(1, &sections, &[TestFact { test: &global, best_score: Some(90.0) }], &WeightTable::default(), 80.0);
        assert_eq!(round2(passed.completion_percentage), 83.33);
        assert_eq!(passed.status, ProgressStatus::Completed);
    }

    #[test]
    fn test_time_credit_completes_at_required_time() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let row = apply_time_credit(None, 1, 2, 0.0, 0.0, 30.0, SuspicionPolicy::FlagOnly, now);
        assert_eq!(row.status, ProgressStatus::Started);

        let row = apply_time_credit(Some(&row), 1, 2, 15.0, 0.0, 30.0, SuspicionPolicy::FlagOnly, now);
        assert_eq!(row.status, ProgressStatus::InProgress);
        assert_eq!(row.completion_percentage, 50.0);

        let row = apply_time_credit(Some(&row), 1, 2, 15.0, 0.0, 30.0, SuspicionPolicy::FlagOnly, now);
        assert_eq!(row.status, ProgressStatus::Completed);
        assert_eq!(row.completion_percentage, 100.0);
        assert_eq!(row.completed_at, Some(now));
    }

    #[test]
    fn test_flagged_time_excluded_only_under_exclude_policy() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let flag_only = apply_time_credit(None, 1, 2, 40.0, 40.0, 30.0, SuspicionPolicy::FlagOnly, now);
        assert_eq!(flag_only.status, ProgressStatus::Completed);

        let exclude = apply_time_credit(None, 1, 2, 40.0, 40.0, 30.0, SuspicionPolicy::Exclude, now);
        assert_eq!(exclude.status, ProgressStatus::InProgress);
        assert_eq!(exclude.completion_percentage, 0.0);
        assert_eq!(exclude.time_spent_seconds, 40.0);
    }

    #[test]
    fn test_availability_rules() {
        let hinted = test_def(1, TestKind::Hinted, 60.0);
        assert!(check_test_availability(&hinted, None, &[], false).available);

        let final_test = test_def(2, TestKind::SectionFinal, 60.0);
        let partial = SectionGate { section_id: 1, passed: false, finals_passed: false, content_percentage: 75.0 };
        assert!(!check_test_availability(&final_test, Some(&partial), &[], true).available);

        let relaxed = TestDefinition { required_completion: Some(70.0), ..final_test.clone() };
        assert!(check_test_availability(&relaxed, Some(&partial), &[], true).available);

        let global = test_def(3, TestKind::GlobalFinal, 60.0);
        let done = SectionGate { section_id: 1, passed: true, finals_passed: true, content_percentage: 100.0 };
        let open_finals = SectionGate { section_id: 2, passed: true, finals_passed: false, content_percentage: 100.0 };
        assert!(check_test_availability(&global, None, &[done], true).available);
        assert!(!check_test_availability(&global, None, &[done, open_finals], true).available);
        assert!(!check_test_availability(&global, None, &[done], false).available);

        let archived = TestDefinition { is_archived: true, ..hinted };
        assert!(!check_test_availability(&archived, None, &[], true).available);
    }

    #[test]
    fn test_sections_unlock_in_order() {
        let gates = [
            SectionGate { section_id: 1, passed: true, finals_passed: true, content_percentage: 100.0 },
            SectionGate { section_id: 2, passed: true, finals_passed: false, content_percentage: 100.0 },
            SectionGate { section_id: 3, passed: false, finals_passed: true, content_percentage: 0.0 },
        ];
        assert_eq!(section_availability(&gates), vec![true, true, false]);
        assert!(section_availability(&[]).is_empty());
    }
}
