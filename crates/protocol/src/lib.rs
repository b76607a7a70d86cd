//! Types shared between the placement engine, the planner service and its clients.
//!
//! Two things live here: the validation verdict that every placement query answers
//! with, and the persisted layout format (plain records plus the `buildings-...`
//! share code that ends up in a page fragment).

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Fragment used for an empty layout and as the prefix of every share code.
pub const SHARE_PREFIX: &str = "buildings";

/// Key under which the layout is mirrored in the local key-value store.
pub const LAYOUT_KEY: &str = "buildingLayout";

/// Why a placement was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "kebab-case")]
pub enum Rejection {
    #[error("placement limit reached")]
    LimitReached,
    #[error("placement is out of bounds")]
    OutOfBounds,
    #[error("cells are already occupied")]
    Occupied,
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LimitReached => "limit-reached",
            Self::OutOfBounds => "out-of-bounds",
            Self::Occupied => "occupied",
        }
    }
}

/// Answer to a "can this go here?" query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Rejection>,
}

impl Verdict {
    pub const ALLOWED: Self = Self {
        allowed: true,
        reason: None,
    };

    pub fn rejected(reason: Rejection) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// One placed building as it is persisted. Instance ids are not persisted; a fresh
/// one is assigned whenever a record is loaded back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutRecord {
    pub name: String,
    pub row: i32,
    pub col: i32,
    // Layouts shared before rotation existed carry no rotation field.
    #[serde(default)]
    pub rotation: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum ShareCodeError {
    #[error("share code must start with `buildings-`")]
    MissingPrefix,
    #[error("share code is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("share code does not contain a layout: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a layout as a page fragment (without the leading `#`).
pub fn encode_share_code(records: &[LayoutRecord]) -> String {
    if records.is_empty() {
        return SHARE_PREFIX.to_string();
    }
    // Serializing plain records into a Vec cannot fail.
    let json = serde_json::to_vec(records).unwrap_or_default();
    format!("{SHARE_PREFIX}-{}", URL_SAFE_NO_PAD.encode(json))
}

/// Decode a page fragment produced by [`encode_share_code`]. A leading `#` is accepted,
/// and so is the standard base64 alphabet used by older links.
pub fn decode_share_code(code: &str) -> Result<Vec<LayoutRecord>, ShareCodeError> {
    let code = code.trim().trim_start_matches('#');
    if code == SHARE_PREFIX {
        return Ok(Vec::new());
    }
    let payload = code
        .strip_prefix(SHARE_PREFIX)
        .and_then(|rest| rest.strip_prefix('-'))
        .ok_or(ShareCodeError::MissingPrefix)?;
    let bytes = match URL_SAFE_NO_PAD.decode(payload) {
        Ok(bytes) => bytes,
        Err(e) => STANDARD.decode(payload).map_err(|_| e)?,
    };
    Ok(serde_json::from_slice(&bytes)?)
}
