//! Session reconciliation: turns per-student attendance rows into the set of
//! teaching sessions actually held, so each session's periods count once.

use crate::model::AttendanceEvent;
use serde::Serialize;
use std::collections::BTreeMap;

/// How rows without a session identifier are grouped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionKeyPolicy {
    /// Unlabeled rows are grouped by `date_subject_markedBy_classTime`, which keeps
    /// distinct same-day sessions apart whenever the row says who ran it and when.
    #[default]
    Strict,
    /// Unlabeled rows collapse into one `date_subject` session per day.
    MergeUnlabeled,
}

impl SessionKeyPolicy {
    pub fn from_merge_flag(merge_unlabeled: bool) -> Self {
        if merge_unlabeled {
            Self::MergeUnlabeled
        } else {
            Self::Strict
        }
    }
}

/// Grouping key for one row. Labeled rows use their session id verbatim.
pub fn session_key(event: &AttendanceEvent, policy: SessionKeyPolicy) -> String {
    if let Some(label) = event.session_label() {
        return label.to_string();
    }
    match policy {
        SessionKeyPolicy::MergeUnlabeled => format!("{}_{}", event.date, event.subject),
        SessionKeyPolicy::Strict => format!(
            "{}_{}_{}_{}",
            event.date,
            event.subject,
            event.marked_by.as_deref().unwrap_or("unknown"),
            event.class_time.as_deref().unwrap_or("unknown"),
        ),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledSession {
    pub subject: String,
    pub date: String,
    pub key: String,
    pub labeled: bool,
    pub periods: i64,
    pub member_count: usize,
    /// Distinct period values seen when members disagree; empty when they agree.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicting_periods: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTally {
    pub sessions: Vec<ReconciledSession>,
    pub total_classes_held: i64,
    pub excluded_events: usize,
}

#[derive(Default)]
struct Group {
    labeled: bool,
    members: usize,
    period_counts: BTreeMap<i64, usize>,
}

/// Most frequent value wins; ties go to the larger period count.
fn majority_periods(counts: &BTreeMap<i64, usize>) -> i64 {
    counts
        .iter()
        .max_by(|(pa, ca), (pb, cb)| ca.cmp(cb).then(pa.cmp(pb)))
        .map(|(p, _)| *p)
        .unwrap_or(0)
}

/// Groups rows into sessions and sums one period count per session.
///
/// Callers pre-filter by subject and window. Malformed rows (blank subject or
/// unparseable date) are skipped and counted in `excluded_events`.
pub fn reconcile<'a, I>(events: I, policy: SessionKeyPolicy) -> SessionTally
where
    I: IntoIterator<Item = &'a AttendanceEvent>,
{
    let mut groups: BTreeMap<(String, String, String), Group> = BTreeMap::new();
    let mut excluded_events = 0_usize;

    for event in events {
        if !event.is_well_formed() {
            excluded_events += 1;
            tracing::warn!(
                event_id = %event.id,
                subject = %event.subject,
                date = %event.date,
                "excluding attendance row with missing or malformed subject/date"
            );
            continue;
        }
        let key = session_key(event, policy);
        let group = groups
            .entry((event.subject.clone(), event.date.clone(), key))
            .or_default();
        group.labeled = group.labeled || event.session_label().is_some();
        group.members += 1;
        *group.period_counts.entry(event.periods).or_insert(0) += 1;
    }

    let mut sessions = Vec::with_capacity(groups.len());
    let mut total_classes_held = 0_i64;
    for ((subject, date, key), group) in groups {
        let periods = majority_periods(&group.period_counts);
        let conflicting_periods: Vec<i64> = if group.period_counts.len() > 1 {
            group.period_counts.keys().copied().collect()
        } else {
            Vec::new()
        };
        if !conflicting_periods.is_empty() {
            tracing::warn!(
                subject = %subject,
                date = %date,
                session = %key,
                seen = ?conflicting_periods,
                chosen = periods,
                "session members disagree on periods; using most frequent value"
            );
        }
        total_classes_held = total_classes_held.saturating_add(periods);
        sessions.push(ReconciledSession {
            subject,
            date,
            key,
            labeled: group.labeled,
            periods,
            member_count: group.members,
            conflicting_periods,
        });
    }

    if excluded_events > 0 {
        tracing::info!(excluded_events, "session reconciliation skipped malformed rows");
    }

    SessionTally {
        sessions,
        total_classes_held,
        excluded_events,
    }
}
