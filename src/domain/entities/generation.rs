use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationType {
    Image,
    Prompt,
}

impl GenerationType {
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationType::Image => "image",
            GenerationType::Prompt => "prompt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitReason {
    CreditsExhausted,
}

/// Answer to "may this user generate right now?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationLimit {
    pub allowed: bool,
    pub reason: Option<LimitReason>,
    pub remaining: i64,
}

impl GenerationLimit {
    pub fn from_remaining(remaining: i64) -> Self {
        if remaining > 0 {
            Self {
                allowed: true,
                reason: None,
                remaining,
            }
        } else {
            Self {
                allowed: false,
                reason: Some(LimitReason::CreditsExhausted),
                remaining: 0,
            }
        }
    }
}
