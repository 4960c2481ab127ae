//! Partition a batch into warm, orphan, and grouped jobs.
//!
//! Jobs are first gathered by label, then each label is bucketed as a whole:
//!
//! * **warm**: every requested field of every job of the label already has a
//!   cached pattern. Runs in `standard` mode regardless of the global mode.
//! * **orphan**: the label appears once in the batch.
//! * **group**: two or more jobs share the label, ordered so that the job
//!   with the most reusable fields goes first and teaches the rest. Members
//!   that are individually warm stay in the group but run in `standard`.
//!
//! A field is *reusable* when its `(label, field)` pair is requested by at
//! least two jobs of the batch.

use std::cmp::Reverse;
use std::collections::HashMap;

use crate::cache::Rules;
use crate::config::Mode;
use crate::extractor::JobPlan;
use crate::models::{Bucket, Job};

/// Key jobs are grouped under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobKey {
    Label(String),
    /// Single group holding the whole batch, used in `standard` mode.
    Batch,
}

/// A job's position in the input batch, with its plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedJob {
    pub index: usize,
    pub plan: JobPlan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobGroup {
    pub key: JobKey,
    /// Teacher first, then students by descending reusable-field count.
    pub members: Vec<PlannedJob>,
}

impl JobGroup {
    pub fn teacher(&self) -> Option<&PlannedJob> {
        self.members.first()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub warm: Vec<PlannedJob>,
    pub orphan: Vec<PlannedJob>,
    /// In order of each group's first appearance in the batch.
    pub groups: Vec<JobGroup>,
}

impl Classification {
    /// Every classified job, bucket by bucket.
    pub fn planned(&self) -> impl Iterator<Item = &PlannedJob> {
        self.warm
            .iter()
            .chain(self.orphan.iter())
            .chain(self.groups.iter().flat_map(|g| g.members.iter()))
    }

    pub fn len(&self) -> usize {
        self.planned().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn grouped_len(&self) -> usize {
        self.groups.iter().map(|g| g.members.len()).sum()
    }
}

/// Classify `jobs` against the rules snapshot taken at the start of the run.
pub fn classify(jobs: &[Job], rules: &Rules, mode: Mode) -> Classification {
    if mode == Mode::Standard {
        return classify_standard(jobs);
    }

    let mut pair_counts: HashMap<(&str, &str), usize> = HashMap::new();
    for job in jobs {
        for field in job.field_schema.names() {
            *pair_counts.entry((job.label.as_str(), field)).or_default() += 1;
        }
    }

    let mut by_label: Vec<(&str, Vec<usize>)> = Vec::new();
    let mut slots: HashMap<&str, usize> = HashMap::new();
    for (index, job) in jobs.iter().enumerate() {
        let label = job.label.as_str();
        match slots.get(label) {
            Some(&slot) => by_label[slot].1.push(index),
            None => {
                slots.insert(label, by_label.len());
                by_label.push((label, vec![index]));
            }
        }
    }

    let mut classification = Classification::default();
    for (label, indices) in by_label {
        if indices.iter().all(|&i| is_warm(&jobs[i], rules)) {
            classification
                .warm
                .extend(indices.into_iter().map(|index| PlannedJob {
                    index,
                    plan: JobPlan::new(Bucket::Warm, Mode::Standard),
                }));
            continue;
        }

        if let &[index] = indices.as_slice() {
            classification.orphan.push(PlannedJob {
                index,
                plan: JobPlan::new(Bucket::Orphan, mode)
                    .with_reusable_fields(reusable_fields(&jobs[index], &pair_counts)),
            });
            continue;
        }

        // Warm members stay with their label but never learn.
        let members = indices
            .into_iter()
            .map(|index| {
                let job = &jobs[index];
                let plan = if is_warm(job, rules) {
                    JobPlan::new(Bucket::Group, Mode::Standard)
                } else {
                    JobPlan::new(Bucket::Group, mode)
                        .with_reusable_fields(reusable_fields(job, &pair_counts))
                };
                PlannedJob { index, plan }
            })
            .collect();
        classification.groups.push(JobGroup {
            key: JobKey::Label(label.to_string()),
            members,
        });
    }

    classification.warm.sort_by_key(|p| p.index);
    classification.orphan.sort_by_key(|p| p.index);
    for group in &mut classification.groups {
        group
            .members
            .sort_by_key(|m| Reverse(m.plan.reusable_count()));
    }

    tracing::info!(
        warm = classification.warm.len(),
        orphan = classification.orphan.len(),
        groups = classification.groups.len(),
        grouped_jobs = classification.grouped_len(),
        "Classified batch"
    );
    classification
}

fn classify_standard(jobs: &[Job]) -> Classification {
    let members: Vec<PlannedJob> = jobs
        .iter()
        .enumerate()
        .map(|(index, _)| PlannedJob {
            index,
            plan: JobPlan::new(Bucket::Group, Mode::Standard),
        })
        .collect();

    let groups = if members.is_empty() {
        Vec::new()
    } else {
        vec![JobGroup {
            key: JobKey::Batch,
            members,
        }]
    };
    Classification {
        groups,
        ..Classification::default()
    }
}

fn reusable_fields<'a>(job: &'a Job, pair_counts: &HashMap<(&str, &str), usize>) -> Vec<&'a str> {
    job.field_schema
        .names()
        .filter(|field| {
            pair_counts
                .get(&(job.label.as_str(), *field))
                .is_some_and(|&n| n >= 2)
        })
        .collect()
}

fn is_warm(job: &Job, rules: &Rules) -> bool {
    let Some(fields) = rules.get(&job.label) else {
        return false;
    };
    job.field_schema.names().all(|f| fields.contains_key(f))
}
