//! Queue envelope codec.
//!
//! Every queue message body is a small JSON object correlating the delivery
//! with a record: `{"job_id": "...", "server_job_id": "..."}`. The envelope is
//! never the source of truth for body or status.

use serde::{Deserialize, Serialize};

use crate::error::JobError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: String,
    pub server_job_id: String,
}

impl JobEnvelope {
    pub fn new(job_id: impl Into<String>, server_job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            server_job_id: server_job_id.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, JobError> {
        serde_json::to_vec(self)
            .map_err(|e| JobError::invalid_envelope(format!("envelope serialization failed: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, JobError> {
        let envelope: JobEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| JobError::invalid_envelope(format!("malformed envelope: {e}")))?;
        if envelope.job_id.is_empty() || envelope.server_job_id.is_empty() {
            return Err(JobError::invalid_envelope("envelope carries an empty identifier"));
        }
        Ok(envelope)
    }
}

pub fn encode_envelope(job_id: &str, server_job_id: &str) -> Result<Vec<u8>, JobError> {
    JobEnvelope::new(job_id, server_job_id).encode()
}

pub fn decode_envelope(bytes: &[u8]) -> Result<(String, String), JobError> {
    let JobEnvelope {
        job_id,
        server_job_id,
    } = JobEnvelope::decode(bytes)?;
    Ok((job_id, server_job_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_as_json_object() {
        let bytes = encode_envelope("job-1", "token-1").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["job_id"], "job-1");
        assert_eq!(value["server_job_id"], "token-1");
        assert_eq!(
            decode_envelope(&bytes).unwrap(),
            ("job-1".to_string(), "token-1".to_string())
        );
    }

    #[test]
    fn malformed_bodies_are_hard_errors() {
        let bodies: [&[u8]; 4] = [
            b"not json",
            b"{}",
            b"{\"job_id\":\"a\"}",
            b"{\"job_id\":\"\",\"server_job_id\":\"t\"}",
        ];
        for body in bodies {
            assert!(matches!(decode_envelope(body), Err(JobError::InvalidEnvelope(_))));
        }
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let body = br#"{"job_id":"job-1","server_job_id":"t","trace":"abc"}"#;
        assert_eq!(decode_envelope(body).unwrap().0, "job-1");
    }
}
