use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use dock_crypto::canonicalize;
use dock_types::{CommandEnvelope, CommandKind, ErrorCode};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
    #[error("unrecognised message type: {0}")]
    UnknownType(String),
    #[error("command timestamp is too old")]
    Expired,
    #[error("command timestamp is in the future")]
    FromFuture,
    #[error("signature required but missing")]
    MissingSignature,
    #[error("signature verification failed")]
    InvalidSignature,
}

impl CodecError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidFormat(_) => ErrorCode::InvalidMessageFormat,
            Self::UnknownType(_) => ErrorCode::InvalidMessageFormat,
            Self::Expired => ErrorCode::CommandExpired,
            Self::FromFuture => ErrorCode::CommandFromFuture,
            Self::MissingSignature => ErrorCode::MissingSignature,
            Self::InvalidSignature => ErrorCode::InvalidSignature,
        }
    }
}

/// Envelope validation and canonical signed-payload construction for the
/// message channel.
#[derive(Clone)]
pub struct MessageCodec {
    command_timeout_ms: u64,
    clock_skew_ms: u64,
}

impl MessageCodec {
    pub fn new(command_timeout_ms: u64, clock_skew_ms: u64) -> Self {
        Self {
            command_timeout_ms,
            clock_skew_ms,
        }
    }

    pub fn parse(&self, raw: &str) -> Result<(CommandEnvelope, CommandKind), CodecError> {
        self.parse_at(raw, Utc::now())
    }

    pub fn parse_at(
        &self,
        raw: &str,
        now: DateTime<Utc>,
    ) -> Result<(CommandEnvelope, CommandKind), CodecError> {
        let envelope: CommandEnvelope = serde_json::from_str(raw)
            .map_err(|error| CodecError::InvalidFormat(error.to_string()))?;

        if envelope.id.trim().is_empty() {
            return Err(CodecError::InvalidFormat("empty id".to_string()));
        }
        if envelope.kind.trim().is_empty() {
            return Err(CodecError::InvalidFormat("empty type".to_string()));
        }
        let timestamp = DateTime::parse_from_rfc3339(&envelope.timestamp)
            .map_err(|_| CodecError::InvalidFormat("unparseable timestamp".to_string()))?
            .with_timezone(&Utc);

        let kind = CommandKind::parse(&envelope.kind)
            .ok_or_else(|| CodecError::UnknownType(envelope.kind.clone()))?;

        // Exactly max-age / max-skew is still admissible.
        if now - timestamp > chrono::Duration::milliseconds(self.command_timeout_ms as i64) {
            return Err(CodecError::Expired);
        }
        if timestamp - now > chrono::Duration::milliseconds(self.clock_skew_ms as i64) {
            return Err(CodecError::FromFuture);
        }

        if kind.requires_signature() && envelope.signature.as_deref().unwrap_or("").is_empty() {
            return Err(CodecError::MissingSignature);
        }

        Ok((envelope, kind))
    }

    /// The canonical byte string both sides sign:
    /// `{"data":…,"nonce":…,"timestamp":…,"type":…}` in canonical key order.
    pub fn canonical_payload(envelope: &CommandEnvelope) -> Vec<u8> {
        let payload = json!({
            "type": envelope.kind,
            "timestamp": envelope.timestamp,
            "nonce": envelope.nonce.as_deref().map(Value::from).unwrap_or(Value::Null),
            "data": envelope.data_or_empty(),
        });
        canonicalize(&payload).into_bytes()
    }

    pub fn verify_signature(
        envelope: &CommandEnvelope,
        public_key_pem: &str,
    ) -> Result<(), CodecError> {
        let signature = envelope
            .signature
            .as_deref()
            .ok_or(CodecError::MissingSignature)?;
        let payload = Self::canonical_payload(envelope);
        if dock_crypto::verify_signature(&payload, signature, public_key_pem) {
            Ok(())
        } else {
            Err(CodecError::InvalidSignature)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn codec() -> MessageCodec {
        MessageCodec::new(30_000, 5_000)
    }

    fn raw_envelope(id: &str, kind: &str, timestamp: DateTime<Utc>, signature: Option<&str>) -> String {
        let mut value = json!({
            "id": id,
            "type": kind,
            "timestamp": timestamp.to_rfc3339(),
            "data": {"workdir": "/tmp/repo"},
        });
        if let Some(signature) = signature {
            value["signature"] = json!(signature);
        }
        value.to_string()
    }

    #[test]
    fn well_formed_signed_envelope_parses() {
        let now = Utc::now();
        let raw = raw_envelope("m-1", "git-status", now, Some("c2ln"));
        let (envelope, kind) = codec().parse_at(&raw, now).expect("parse");
        assert_eq!(kind, CommandKind::GitStatus);
        assert_eq!(envelope.id, "m-1");
    }

    #[test]
    fn unknown_type_is_invalid_format() {
        let now = Utc::now();
        let raw = raw_envelope("m-1", "rm-rf", now, Some("c2ln"));
        let err = codec().parse_at(&raw, now).expect_err("unknown");
        assert_eq!(err.code(), ErrorCode::InvalidMessageFormat);
    }

    #[test]
    fn missing_signature_rejected_except_health_check() {
        let now = Utc::now();
        let raw = raw_envelope("m-1", "git-status", now, None);
        let err = codec().parse_at(&raw, now).expect_err("missing signature");
        assert_eq!(err.code(), ErrorCode::MissingSignature);

        let raw = raw_envelope("m-2", "health-check", now, None);
        assert!(codec().parse_at(&raw, now).is_ok());
    }

    #[test]
    fn age_boundary_is_inclusive() {
        let now = Utc::now();
        let at_limit = now - Duration::milliseconds(30_000);
        let raw = raw_envelope("m-1", "health-check", at_limit, None);
        assert!(codec().parse_at(&raw, now).is_ok());

        let over = now - Duration::milliseconds(30_001);
        let raw = raw_envelope("m-2", "health-check", over, None);
        let err = codec().parse_at(&raw, now).expect_err("expired");
        assert_eq!(err.code(), ErrorCode::CommandExpired);
    }

    #[test]
    fn future_skew_boundary_is_inclusive() {
        let now = Utc::now();
        let at_limit = now + Duration::milliseconds(5_000);
        let raw = raw_envelope("m-1", "health-check", at_limit, None);
        assert!(codec().parse_at(&raw, now).is_ok());

        let over = now + Duration::milliseconds(5_001);
        let raw = raw_envelope("m-2", "health-check", over, None);
        let err = codec().parse_at(&raw, now).expect_err("from future");
        assert_eq!(err.code(), ErrorCode::CommandFromFuture);
    }

    #[test]
    fn canonical_payload_is_order_stable() {
        let a = CommandEnvelope {
            id: "m-1".into(),
            kind: "git-status".into(),
            data: serde_json::from_str(r#"{"b":2,"a":1}"#).expect("data"),
            timestamp: "2026-08-01T12:00:00Z".into(),
            nonce: None,
            signature: None,
        };
        let mut b = a.clone();
        b.data = serde_json::from_str(r#"{"a":1,"b":2}"#).expect("data");
        assert_eq!(
            MessageCodec::canonical_payload(&a),
            MessageCodec::canonical_payload(&b)
        );
        let text = String::from_utf8(MessageCodec::canonical_payload(&a)).expect("utf8");
        assert!(text.contains("\"nonce\":null"));
        assert!(text.starts_with('{'));
    }

    #[test]
    fn signature_round_trip_against_a_real_keypair() {
        let dir = tempfile::tempdir().expect("tempdir");
        let identity = dock_crypto::BridgeIdentity::load_or_generate(dir.path()).expect("identity");
        let mut envelope = CommandEnvelope {
            id: "m-1".into(),
            kind: "git-status".into(),
            data: serde_json::from_str(r#"{"workdir":"/tmp/repo"}"#).expect("data"),
            timestamp: Utc::now().to_rfc3339(),
            nonce: Some("n-1".into()),
            signature: None,
        };
        let payload = MessageCodec::canonical_payload(&envelope);
        envelope.signature = Some(identity.sign(&payload).expect("sign"));

        assert!(MessageCodec::verify_signature(&envelope, identity.public_key_pem()).is_ok());

        // Any data mutation invalidates the signature.
        envelope.data = serde_json::from_str(r#"{"workdir":"/tmp/other"}"#).expect("data");
        assert!(matches!(
            MessageCodec::verify_signature(&envelope, identity.public_key_pem()),
            Err(CodecError::InvalidSignature)
        ));
    }
}
