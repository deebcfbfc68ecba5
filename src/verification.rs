//! In-memory decisions for a faculty photo review pass.

use crate::model::{AttendanceEvent, AttendanceMethod, AttendanceStatus, Student, TempPhoto};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("no open verification for session {0}")]
    NoSession(String),
    #[error("photo {0} is not part of this verification")]
    UnknownPhoto(String),
}

impl VerificationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoSession(_) => "no_session",
            Self::UnknownPhoto(_) => "not_found",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Present,
    Absent,
    Pending,
}

impl Decision {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Pending => "pending",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Self::Present => Self::Absent,
            Self::Absent | Self::Pending => Self::Present,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSummary {
    pub present: usize,
    pub absent: usize,
    pub pending: usize,
    pub submitted: usize,
    pub total: usize,
}

/// What a save writes. Built without touching the store so a failed commit
/// leaves the session untouched.
#[derive(Debug, Clone)]
pub struct SavePlan {
    pub events: Vec<AttendanceEvent>,
    /// `(photo id, decision)` for every photo in the pass.
    pub processed: Vec<(String, Decision)>,
    pub absent_decided: Vec<String>,
    pub inferred_absent: Vec<String>,
    /// Decided present but already holding an event for the session.
    pub already_marked: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VerificationSession {
    pub qr_session_id: String,
    photos: Vec<TempPhoto>,
    decisions: HashMap<String, Decision>,
    roster: Vec<Student>,
}

impl VerificationSession {
    /// Every submitted photo starts out `present`.
    pub fn open(qr_session_id: impl Into<String>, photos: Vec<TempPhoto>, roster: Vec<Student>) -> Self {
        let decisions = photos
            .iter()
            .map(|p| (p.id.clone(), Decision::Present))
            .collect();
        Self {
            qr_session_id: qr_session_id.into(),
            photos,
            decisions,
            roster,
        }
    }

    pub fn photos(&self) -> &[TempPhoto] {
        &self.photos
    }

    pub fn roster_len(&self) -> usize {
        self.roster.len()
    }

    pub fn decision(&self, photo_id: &str) -> Option<Decision> {
        self.decisions.get(photo_id).copied()
    }

    pub fn toggle(&mut self, photo_id: &str) -> Result<Decision, VerificationError> {
        let d = self
            .decisions
            .get_mut(photo_id)
            .ok_or_else(|| VerificationError::UnknownPhoto(photo_id.to_string()))?;
        *d = d.toggled();
        Ok(*d)
    }

    pub fn set(&mut self, photo_id: &str, decision: Decision) -> Result<Decision, VerificationError> {
        let d = self
            .decisions
            .get_mut(photo_id)
            .ok_or_else(|| VerificationError::UnknownPhoto(photo_id.to_string()))?;
        *d = decision;
        Ok(decision)
    }

    fn submitters(&self) -> HashSet<&str> {
        self.photos.iter().map(|p| p.student_id.as_str()).collect()
    }

    pub fn summary(&self) -> VerificationSummary {
        let mut present = 0;
        let mut absent = 0;
        let mut pending = 0;
        for d in self.decisions.values() {
            match d {
                Decision::Present => present += 1,
                Decision::Absent => absent += 1,
                Decision::Pending => pending += 1,
            }
        }
        let submitters = self.submitters();
        let no_photo = self
            .roster
            .iter()
            .filter(|s| !submitters.contains(s.id.as_str()))
            .count();
        VerificationSummary {
            present,
            absent: absent + no_photo,
            pending,
            submitted: self.photos.len(),
            total: self.roster.len(),
        }
    }

    /// One `present` event per photo decided present. Absent and still-pending
    /// photos produce no event; neither do roster members without a photo, nor
    /// students in `marked` (those with an event for this session already).
    pub fn plan_save(&self, verified_by: &str, marked_at: &str, marked: &HashSet<String>) -> SavePlan {
        let mut events = Vec::new();
        let mut processed = Vec::with_capacity(self.photos.len());
        let mut absent_decided = Vec::new();
        let mut already_marked = Vec::new();
        for photo in &self.photos {
            let decision = self.decision(&photo.id).unwrap_or(Decision::Pending);
            processed.push((photo.id.clone(), decision));
            if decision != Decision::Present {
                absent_decided.push(photo.student_id.clone());
                continue;
            }
            if marked.contains(&photo.student_id)
                || events.iter().any(|e: &AttendanceEvent| e.user_id == photo.student_id)
            {
                already_marked.push(photo.student_id.clone());
                continue;
            }
            events.push(AttendanceEvent {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: photo.student_id.clone(),
                student_name: photo.student_name.clone(),
                reg_number: photo.reg_number.clone(),
                school: photo.school.clone(),
                batch: photo.batch.clone(),
                subject: photo.subject.clone(),
                date: photo.date.clone(),
                periods: photo.periods.max(1),
                status: AttendanceStatus::Present,
                session_id: None,
                qr_session_id: Some(self.qr_session_id.clone()),
                marked_by: Some(verified_by.to_string()),
                faculty_name: photo.faculty_name.clone(),
                method: AttendanceMethod::QrPhotoVerified,
                has_photo: false,
                class_time: None,
                marked_at: Some(marked_at.to_string()),
            });
        }

        let submitters = self.submitters();
        let inferred_absent = self
            .roster
            .iter()
            .filter(|s| !submitters.contains(s.id.as_str()))
            .map(|s| s.id.clone())
            .collect();

        SavePlan {
            events,
            processed,
            absent_decided,
            inferred_absent,
            already_marked,
        }
    }
}

/// Open review passes keyed by QR session id.
#[derive(Default)]
pub struct DecisionStore {
    sessions: HashMap<String, VerificationSession>,
}

impl DecisionStore {
    /// Re-opening a session replaces any earlier pass for it.
    pub fn open(&mut self, session: VerificationSession) -> &VerificationSession {
        match self.sessions.entry(session.qr_session_id.clone()) {
            Entry::Occupied(mut slot) => {
                slot.insert(session);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(session),
        }
    }

    pub fn get(&self, qr_session_id: &str) -> Result<&VerificationSession, VerificationError> {
        self.sessions
            .get(qr_session_id)
            .ok_or_else(|| VerificationError::NoSession(qr_session_id.to_string()))
    }

    pub fn get_mut(&mut self, qr_session_id: &str) -> Result<&mut VerificationSession, VerificationError> {
        self.sessions
            .get_mut(qr_session_id)
            .ok_or_else(|| VerificationError::NoSession(qr_session_id.to_string()))
    }

    pub fn close(&mut self, qr_session_id: &str) -> Option<VerificationSession> {
        self.sessions.remove(qr_session_id)
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}
