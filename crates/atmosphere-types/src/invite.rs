use crate::mesh::{MeshCredentials, MeshId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Portable encoding of mesh credentials that lets a new device join: base64
/// (no-wrap) of UTF-8 JSON. `secret` is 64 lowercase hex digits, matching the
/// wire format in §6 of the spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InviteToken {
    pub mesh_id: MeshId,
    pub secret: String,
    pub app_id: String,
    #[serde(rename = "bigllama_url", skip_serializing_if = "Option::is_none")]
    pub wide_area_url: Option<String>,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum InviteError {
    #[error("invite token is not valid base64")]
    BadBase64,
    #[error("invite token is not valid JSON: {0}")]
    BadJson(#[from] serde_json::Error),
    #[error("invite token secret is not 64 lowercase hex digits")]
    BadSecret,
    #[error("invite token expired at {0}")]
    Expired(DateTime<Utc>),
}

impl InviteToken {
    pub fn new(credentials: &MeshCredentials, app_id: impl Into<String>, wide_area_url: Option<String>) -> Self {
        Self {
            mesh_id: credentials.mesh_id,
            secret: hex::encode(credentials.shared_secret),
            app_id: app_id.into(),
            wide_area_url,
            created: Utc::now(),
            expires: credentials.expires_at,
        }
    }

    pub fn to_base64(&self) -> String {
        use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
        let json = serde_json::to_vec(self).expect("InviteToken always serializes");
        STANDARD_NO_PAD.encode(json)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, InviteError> {
        use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
        let json = STANDARD_NO_PAD.decode(encoded.trim()).map_err(|_| InviteError::BadBase64)?;
        let token: InviteToken = serde_json::from_slice(&json)?;
        if token.secret.len() != 64 || !token.secret.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(InviteError::BadSecret);
        }
        Ok(token)
    }

    pub fn check_not_expired(&self, now: DateTime<Utc>) -> Result<(), InviteError> {
        match self.expires {
            Some(exp) if exp <= now => Err(InviteError::Expired(exp)),
            _ => Ok(()),
        }
    }

    pub fn shared_secret(&self) -> Result<[u8; 32], InviteError> {
        let bytes = hex::decode(&self.secret).map_err(|_| InviteError::BadSecret)?;
        bytes.try_into().map_err(|_| InviteError::BadSecret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_roundtrip_is_identity() {
        let creds = MeshCredentials::generate();
        let token = InviteToken::new(&creds, "com.example.app", Some("https://relay.example".into()));
        let encoded = token.to_base64();
        let decoded = InviteToken::from_base64(&encoded).unwrap();
        assert_eq!(token, decoded);
    }

    #[test]
    fn rejects_malformed_base64() {
        assert!(matches!(InviteToken::from_base64("not base64!!"), Err(InviteError::BadBase64)));
    }

    #[test]
    fn rejects_short_secret() {
        let creds = MeshCredentials::generate();
        let mut token = InviteToken::new(&creds, "app", None);
        token.secret = "deadbeef".into();
        let encoded = token.to_base64();
        assert!(matches!(InviteToken::from_base64(&encoded), Err(InviteError::BadSecret)));
    }

    #[test]
    fn expired_token_is_detected() {
        let mut creds = MeshCredentials::generate();
        creds.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        let token = InviteToken::new(&creds, "app", None);
        assert!(matches!(token.check_not_expired(Utc::now()), Err(InviteError::Expired(_))));
    }
}
