//! Progress reads and section/topic recomputation

use super::Engine;
use crate::access::{read, CacheCategory};
use crate::aggregator::{
    calculate_section_progress, calculate_topic_progress, check_test_availability,
    round2, section_availability, Availability, SectionComputation, SectionFact, SectionGate,
    SubsectionFact, TestFact,
};
use crate::error::{ProgressError, ProgressResult};
use crate::models::{
    AggregateProgress, ResourceKind, SubsectionKind, SubsectionProgress, TestDefinition, TestKind,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use tw_common::events::ProgressEvent;
use tw_common::ProgressStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsectionView {
    pub subsection_id: i64,
    pub title: String,
    pub kind: SubsectionKind,
    pub status: ProgressStatus,
    pub time_spent_seconds: f64,
    pub completion_percentage: f64,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestView {
    pub test_id: i64,
    pub title: String,
    pub kind: TestKind,
    pub best_score: Option<f64>,
    pub passed: bool,
    pub available: bool,
    pub unavailable_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionView {
    pub section_id: i64,
    pub title: String,
    pub completion_percentage: f64,
    /// Subsections only, used to gate section-final tests
    pub content_percentage: f64,
    pub status: ProgressStatus,
    pub passed: bool,
    pub available: bool,
    pub time_spent_seconds: f64,
    pub subsections: Vec<SubsectionView>,
    pub tests: Vec<TestView>,
}

/// `GetProgress(user, topic)`: percentages per topic, section and
/// subsection, rounded to two decimals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicProgressView {
    pub user_id: i64,
    pub topic_id: i64,
    pub title: String,
    pub completion_percentage: f64,
    pub status: ProgressStatus,
    pub passed: bool,
    pub time_spent_seconds: f64,
    pub sections: Vec<SectionView>,
    /// Topic-level tests (global finals and topic-level practice tests)
    pub global_tests: Vec<TestView>,
    pub computed_at: DateTime<Utc>,
}

impl TopicProgressView {
    pub fn find_test(&self, test_id: i64) -> Option<&TestView> {
        self.sections
            .iter()
            .flat_map(|s| s.tests.iter())
            .chain(self.global_tests.iter())
            .find(|t| t.test_id == test_id)
    }
}

/// Facts decided but not yet committed, applied over the stored ones
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Pending<'a> {
    pub subsection: Option<&'a SubsectionProgress>,
    /// Newly scored attempt as (test id, score)
    pub score: Option<(i64, f64)>,
}

/// A full recomputation: the exposed view plus the derived rows it implies
pub(crate) struct ComputedTopic {
    pub view: TopicProgressView,
    pub sections: Vec<AggregateProgress>,
    pub topic: AggregateProgress,
}

fn fact_for<'a>(test: &'a TestDefinition, best: &HashMap<i64, f64>) -> TestFact<'a> {
    TestFact {
        test,
        best_score: best.get(&test.id).copied(),
    }
}

fn test_view(fact: &TestFact<'_>, availability: Availability) -> TestView {
    TestView {
        test_id: fact.test.id,
        title: fact.test.title.clone(),
        kind: fact.test.kind,
        best_score: fact.best_score,
        passed: fact.passed(),
        available: availability.available,
        unavailable_reason: availability.reason,
    }
}

impl Engine {
    /// `GetProgress(user, topic)`
    ///
    /// Overdue attempts of the student are expired first. The view itself
    /// is served from the progress cache when fresh.
    pub async fn get_progress(&self, user_id: i64, topic_id: i64) -> ProgressResult<TopicProgressView> {
        self.require_access(user_id, ResourceKind::Topic, topic_id).await?;
        self.expire_overdue_for_user(user_id).await?;
        self.topic_view(user_id, topic_id).await
    }

    /// Whether the student may start the test now, computed from current
    /// (uncached) progress
    pub async fn check_test_availability(
        &self,
        user_id: i64,
        test_id: i64,
    ) -> ProgressResult<Availability> {
        let store = self.inner.store.as_ref();
        let test = read(|| store.test(test_id))
            .await?
            .ok_or_else(|| ProgressError::not_found(ResourceKind::Test, test_id))?;

        self.require_access(user_id, ResourceKind::Test, test_id).await?;
        self.expire_overdue_for_user(user_id).await?;
        self.availability_of(user_id, &test).await
    }

    pub(crate) async fn availability_of(
        &self,
        user_id: i64,
        test: &TestDefinition,
    ) -> ProgressResult<Availability> {
        if test.is_archived {
            return Ok(check_test_availability(test, None, &[], false));
        }

        let topic_id = self.topic_of_test(test).await?;
        let computed = self.compute_topic(user_id, topic_id, Pending::default()).await?;
        Ok(computed
            .view
            .find_test(test.id)
            .map(|t| Availability {
                available: t.available,
                reason: t.unavailable_reason.clone(),
            })
            .unwrap_or(Availability {
                available: false,
                reason: Some("test is not part of an active section".to_string()),
            }))
    }

    pub(crate) async fn topic_of_test(&self, test: &TestDefinition) -> ProgressResult<i64> {
        if let Some(topic_id) = test.topic_id {
            return Ok(topic_id);
        }
        let section_id = test.section_id.ok_or_else(|| {
            ProgressError::Internal(format!("test {} has no section or topic", test.id))
        })?;
        let store = self.inner.store.as_ref();
        let section = read(|| store.section(section_id))
            .await?
            .ok_or_else(|| ProgressError::not_found(ResourceKind::Section, section_id))?;
        Ok(section.topic_id)
    }

    /// Cached topic view (progress TTL)
    pub(crate) async fn topic_view(&self, user_id: i64, topic_id: i64) -> ProgressResult<TopicProgressView> {
        self.inner
            .guard
            .get_or_compute(
                CacheCategory::Progress,
                &format!("topic:{}:{}", user_id, topic_id),
                || async { Ok(self.compute_topic(user_id, topic_id, Pending::default()).await?.view) },
            )
            .await
    }

    /// Recompute the whole topic from stored facts with `pending` applied
    pub(crate) async fn compute_topic(
        &self,
        user_id: i64,
        topic_id: i64,
        pending: Pending<'_>,
    ) -> ProgressResult<ComputedTopic> {
        let store = self.inner.store.as_ref();
        let topic = read(|| store.topic(topic_id))
            .await?
            .ok_or_else(|| ProgressError::not_found(ResourceKind::Topic, topic_id))?;
        let sections = read(|| store.sections_for_topic(topic_id)).await?;
        let subsections = read(|| store.subsections_for_topic(topic_id)).await?;
        let tests = read(|| store.tests_for_topic(topic_id)).await?;

        let mut rows: HashMap<i64, SubsectionProgress> =
            read(|| store.subsection_progress_for_topic(user_id, topic_id))
                .await?
                .into_iter()
                .map(|row| (row.subsection_id, row))
                .collect();
        if let Some(row) = pending.subsection {
            rows.insert(row.subsection_id, row.clone());
        }

        let test_ids: Vec<i64> = tests.iter().map(|t| t.id).collect();
        let mut best = read(|| store.best_scores(user_id, &test_ids)).await?;
        if let Some((test_id, score)) = pending.score {
            let entry = best.entry(test_id).or_insert(score);
            *entry = entry.max(score);
        }
        let weights = self.inner.weights.table().await;
        let threshold = self.inner.config.progress.section_completion_threshold;
        let now = self.inner.clock.now();

        let (global_tests, section_tests): (Vec<&TestDefinition>, Vec<&TestDefinition>) = tests
            .iter()
            .partition(|t| t.section_id.is_none() || t.kind == TestKind::GlobalFinal);

        let computations: Vec<SectionComputation> = sections
            .iter()
            .map(|section| {
                let subsection_facts: Vec<SubsectionFact> = subsections
                    .iter()
                    .filter(|s| s.section_id == section.id)
                    .map(|s| SubsectionFact {
                        subsection: s,
                        status: rows
                            .get(&s.id)
                            .map(|r| r.status)
                            .unwrap_or(ProgressStatus::Started),
                    })
                    .collect();
                let test_facts: Vec<TestFact> = section_tests
                    .iter()
                    .filter(|t| t.section_id == Some(section.id))
                    .map(|t| fact_for(t, &best))
                    .collect();
                calculate_section_progress(section.id, &subsection_facts, &test_facts, &weights, threshold)
            })
            .collect();

        let gates: Vec<SectionGate> = computations.iter().map(SectionComputation::gate).collect();
        let unlocked = section_availability(&gates);

        let global_facts: Vec<TestFact> = global_tests.iter().map(|t| fact_for(t, &best)).collect();
        let section_facts: Vec<SectionFact> = sections
            .iter()
            .zip(&computations)
            .map(|(section, computation)| SectionFact {
                section_id: section.id,
                weight: section.weight,
                completion_percentage: computation.completion_percentage,
            })
            .collect();
        let topic_result =
            calculate_topic_progress(topic_id, &section_facts, &global_facts, &weights, threshold);

        let mut section_views = Vec::with_capacity(sections.len());
        for ((section, computation), available) in sections.iter().zip(&computations).zip(unlocked) {
            let subsection_views: Vec<SubsectionView> = subsections
                .iter()
                .filter(|s| s.section_id == section.id)
                .map(|s| {
                    let row = rows.get(&s.id);
                    SubsectionView {
                        subsection_id: s.id,
                        title: s.title.clone(),
                        kind: s.kind,
                        status: row.map(|r| r.status).unwrap_or(ProgressStatus::Started),
                        time_spent_seconds: row.map(|r| r.time_spent_seconds).unwrap_or(0.0),
                        completion_percentage: round2(row.map(|r| r.completion_percentage).unwrap_or(0.0)),
                        completed_at: row.and_then(|r| r.completed_at),
                    }
                })
                .collect();

            let gate = computation.gate();
            let test_views = section_tests
                .iter()
                .filter(|t| t.section_id == Some(section.id))
                .map(|t| {
                    let f = fact_for(t, &best);
                    let availability = if available {
                        check_test_availability(t, Some(&gate), &gates, true)
                    } else {
                        Availability {
                            available: false,
                            reason: Some("section is locked".to_string()),
                        }
                    };
                    test_view(&f, availability)
                })
                .collect();

            section_views.push(SectionView {
                section_id: section.id,
                title: section.title.clone(),
                completion_percentage: round2(computation.completion_percentage),
                content_percentage: round2(computation.content_percentage),
                status: computation.status,
                passed: computation.passed,
                available,
                time_spent_seconds: subsection_views.iter().map(|v| v.time_spent_seconds).sum(),
                subsections: subsection_views,
                tests: test_views,
            });
        }

        let global_views: Vec<TestView> = global_facts
            .iter()
            .map(|f| {
                let earlier_passed = global_facts
                    .iter()
                    .filter(|o| o.test.kind == TestKind::GlobalFinal && o.test.id < f.test.id)
                    .all(|o| o.passed());
                test_view(f, check_test_availability(f.test, None, &gates, earlier_passed))
            })
            .collect();

        let view = TopicProgressView {
            user_id,
            topic_id,
            title: topic.title,
            completion_percentage: round2(topic_result.completion_percentage),
            status: topic_result.status,
            passed: topic_result.passed,
            time_spent_seconds: section_views.iter().map(|s| s.time_spent_seconds).sum(),
            sections: section_views,
            global_tests: global_views,
            computed_at: now,
        };

        debug!(
            user_id,
            topic_id,
            completion = view.completion_percentage,
            "Topic progress computed"
        );

        Ok(ComputedTopic {
            sections: computations
                .iter()
                .map(|c| AggregateProgress {
                    user_id,
                    resource_id: c.section_id,
                    status: c.status,
                    completion_percentage: c.completion_percentage,
                    updated_at: now,
                })
                .collect(),
            topic: AggregateProgress {
                user_id,
                resource_id: topic_id,
                status: topic_result.status,
                completion_percentage: topic_result.completion_percentage,
                updated_at: now,
            },
            view,
        })
    }

    /// Section/topic rows that differ from what is stored, with the events
    /// to emit once they are committed. Caller holds the user lock.
    pub(crate) async fn derived_changes(
        &self,
        user_id: i64,
        topic_id: i64,
        pending: Pending<'_>,
    ) -> ProgressResult<(Vec<AggregateProgress>, Option<AggregateProgress>, Vec<ProgressEvent>)> {
        let computed = self.compute_topic(user_id, topic_id, pending).await?;
        let store = self.inner.store.as_ref();
        let mut events = Vec::new();

        let mut sections = Vec::new();
        for row in computed.sections {
            let stored = read(|| store.section_progress(user_id, row.resource_id)).await?;
            if stored.as_ref().is_some_and(|s| s.same_state(&row)) {
                continue;
            }
            events.push(ProgressEvent::SectionProgressChanged {
                user_id,
                section_id: row.resource_id,
                completion_percentage: round2(row.completion_percentage),
                status: row.status,
                timestamp: row.updated_at,
            });
            sections.push(row);
        }

        let stored = read(|| store.topic_progress(user_id, topic_id)).await?;
        let topic = if stored.as_ref().is_some_and(|s| s.same_state(&computed.topic)) {
            None
        } else {
            events.push(ProgressEvent::TopicProgressChanged {
                user_id,
                topic_id,
                completion_percentage: round2(computed.topic.completion_percentage),
                status: computed.topic.status,
                timestamp: computed.topic.updated_at,
            });
            Some(computed.topic)
        };

        Ok((sections, topic, events))
    }
}
