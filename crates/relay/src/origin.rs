// Origin allowlist for WebSocket upgrades.
//
// Browsers always send `Origin` on a WebSocket handshake; native clients
// usually do not. Requests without the header are let through.

use axum::http::{header::ORIGIN, HeaderMap};

use crate::error::{ErrorCode, RelayError};

#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed: Option<Vec<String>>,
}

impl OriginPolicy {
    /// Accepts every origin.
    pub fn any() -> Self {
        Self { allowed: None }
    }

    pub fn from_config(allowed: Option<Vec<String>>) -> Self {
        Self { allowed }
    }

    pub fn check(&self, headers: &HeaderMap) -> Result<(), RelayError> {
        let Some(allowed) = &self.allowed else {
            return Ok(());
        };
        let Some(origin) = headers.get(ORIGIN) else {
            return Ok(());
        };

        let origin = origin.to_str().unwrap_or_default().trim();
        if allowed.iter().any(|candidate| candidate.eq_ignore_ascii_case(origin)) {
            Ok(())
        } else {
            Err(RelayError::new(
                ErrorCode::OriginForbidden,
                format!("origin `{origin}` is not allowed"),
            ))
        }
    }
}
