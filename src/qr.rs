//! Short-lived QR attendance sessions.
//!
//! A session is only valid inside the process that issued it. The payload a
//! QR code would encode carries a sha256 token over the session id and issue
//! time, keyed by the process secret.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QrError {
    #[error("invalid QR payload: {0}")]
    Invalid(String),
    #[error("QR session {0} has expired")]
    Expired(String),
    #[error("unknown QR session: {0}")]
    NotFound(String),
}

impl QrError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "qr_invalid",
            Self::Expired(_) => "qr_expired",
            Self::NotFound(_) => "not_found",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QrIssue {
    pub school: String,
    pub batch: String,
    pub subject: String,
    pub periods: i64,
    pub faculty_id: String,
    pub faculty_name: Option<String>,
    pub date: String,
    pub class_time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrPayload {
    pub session_id: String,
    pub school: String,
    pub batch: String,
    pub subject: String,
    pub periods: i64,
    pub faculty_id: String,
    #[serde(default)]
    pub faculty_name: Option<String>,
    pub date: String,
    pub class_time: String,
    pub issued_at_ms: i64,
    pub expires_at_ms: i64,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct QrSession {
    pub payload: QrPayload,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl QrSession {
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        let ms = (self.expires_at - now).num_milliseconds();
        if ms <= 0 {
            0
        } else {
            (ms + 999) / 1000
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrStatus {
    pub session_id: String,
    pub remaining_seconds: i64,
    pub expired: bool,
}

fn session_token(secret: &str, session_id: &str, issued_at_ms: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(session_id.as_bytes());
    hasher.update(issued_at_ms.to_string().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Sessions older than this are forgotten on the next issue.
const RETAIN_HOURS: i64 = 24;

pub struct QrRegistry {
    secret: String,
    sessions: HashMap<String, QrSession>,
}

impl QrRegistry {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            sessions: HashMap::new(),
        }
    }

    pub fn issue(&mut self, req: QrIssue, now: DateTime<Utc>, validity_seconds: i64) -> QrSession {
        self.prune(now);
        let session_id = format!(
            "{}_{}_{}",
            req.subject,
            req.batch,
            uuid::Uuid::new_v4().simple()
        );
        let expires_at = now + Duration::seconds(validity_seconds.max(1));
        let issued_at_ms = now.timestamp_millis();
        let token = session_token(&self.secret, &session_id, issued_at_ms);
        let session = QrSession {
            payload: QrPayload {
                session_id: session_id.clone(),
                school: req.school,
                batch: req.batch,
                subject: req.subject,
                periods: req.periods.max(1),
                faculty_id: req.faculty_id,
                faculty_name: req.faculty_name,
                date: req.date,
                class_time: req.class_time,
                issued_at_ms,
                expires_at_ms: expires_at.timestamp_millis(),
                token,
            },
            issued_at: now,
            expires_at,
        };
        tracing::info!(
            session_id = %session_id,
            subject = %session.payload.subject,
            batch = %session.payload.batch,
            validity_seconds,
            "issued QR session"
        );
        self.sessions.insert(session_id, session.clone());
        session
    }

    pub fn get(&self, session_id: &str) -> Option<&QrSession> {
        self.sessions.get(session_id)
    }

    pub fn status(&self, session_id: &str, now: DateTime<Utc>) -> Result<QrStatus, QrError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| QrError::NotFound(session_id.to_string()))?;
        Ok(QrStatus {
            session_id: session_id.to_string(),
            remaining_seconds: session.remaining_seconds(now),
            expired: session.is_expired(now),
        })
    }

    /// Authenticates a scanned payload and returns the registered session.
    ///
    /// The registered copy is authoritative; payload fields other than the
    /// session id, issue time and token are not trusted.
    pub fn validate(&self, payload: &QrPayload, now: DateTime<Utc>) -> Result<&QrSession, QrError> {
        let expected = session_token(&self.secret, &payload.session_id, payload.issued_at_ms);
        if expected != payload.token {
            return Err(QrError::Invalid("token mismatch".to_string()));
        }
        let session = self
            .sessions
            .get(&payload.session_id)
            .ok_or_else(|| QrError::Invalid(format!("session {} is not active", payload.session_id)))?;
        if session.payload.issued_at_ms != payload.issued_at_ms {
            return Err(QrError::Invalid("issue time mismatch".to_string()));
        }
        if session.is_expired(now) {
            return Err(QrError::Expired(payload.session_id.clone()));
        }
        Ok(session)
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - Duration::hours(RETAIN_HOURS);
        self.sessions.retain(|_, s| s.expires_at > horizon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue_req() -> QrIssue {
        QrIssue {
            school: "School of Technology".to_string(),
            batch: "24B1".to_string(),
            subject: "DSA".to_string(),
            periods: 0,
            faculty_id: "fac-1".to_string(),
            faculty_name: Some("Dr. Rao".to_string()),
            date: "2025-09-20".to_string(),
            class_time: "09:00".to_string(),
        }
    }

    #[test]
    fn issued_session_validates_until_expiry() {
        let mut reg = QrRegistry::new("secret");
        let now = Utc::now();
        let session = reg.issue(issue_req(), now, 30);
        assert_eq!(session.payload.periods, 1);
        assert!(session.payload.session_id.starts_with("DSA_24B1_"));
        assert_eq!(session.payload.token.len(), 64);

        let payload = session.payload.clone();
        assert!(reg.validate(&payload, now + Duration::seconds(10)).is_ok());
        assert_eq!(
            reg.validate(&payload, now + Duration::seconds(30)).map(|_| ()),
            Err(QrError::Expired(payload.session_id.clone()))
        );
    }

    #[test]
    fn tampered_token_is_rejected() {
        let mut reg = QrRegistry::new("secret");
        let now = Utc::now();
        let mut payload = reg.issue(issue_req(), now, 30).payload;
        payload.issued_at_ms += 1;
        let err = reg.validate(&payload, now).map(|_| ()).unwrap_err();
        assert_eq!(err.code(), "qr_invalid");
    }

    #[test]
    fn other_process_secret_is_rejected() {
        let mut issuer = QrRegistry::new("a");
        let verifier = QrRegistry::new("b");
        let now = Utc::now();
        let payload = issuer.issue(issue_req(), now, 30).payload;
        assert_eq!(verifier.validate(&payload, now).map(|_| ()).unwrap_err().code(), "qr_invalid");
    }

    #[test]
    fn status_counts_down() {
        let mut reg = QrRegistry::new("secret");
        let now = Utc::now();
        let id = reg.issue(issue_req(), now, 30).payload.session_id;
        let st = reg.status(&id, now + Duration::milliseconds(500)).expect("status");
        assert_eq!(st.remaining_seconds, 30);
        assert!(!st.expired);
        let st = reg.status(&id, now + Duration::seconds(31)).expect("status");
        assert_eq!(st.remaining_seconds, 0);
        assert!(st.expired);
        assert_eq!(reg.status("nope", now).unwrap_err().code(), "not_found");
    }
}
