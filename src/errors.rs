use std::fmt::Debug;

use thiserror::Error;

/// The external billing API a [`StorefrontError`] originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorefrontApi {
    GooglePlayDeveloperApi,
    AppStoreServerApi,
    AppStoreConnectApi,
    AppStoreReceiptApi,
    StripeApi,
    FirebaseMessagingApi,
}

impl std::fmt::Display for StorefrontApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StorefrontApi::GooglePlayDeveloperApi => "Google Play Developer API",
            StorefrontApi::AppStoreServerApi => "App Store Server API",
            StorefrontApi::AppStoreConnectApi => "App Store Connect API",
            StorefrontApi::AppStoreReceiptApi => "App Store verifyReceipt",
            StorefrontApi::StripeApi => "Stripe API",
            StorefrontApi::FirebaseMessagingApi => "Firebase Cloud Messaging API",
        };
        f.write_str(name)
    }
}

/// Errors raised while calling out to one of the billing platforms.
#[derive(Debug, Error)]
pub enum StorefrontError {
    #[error("{api} credentials are invalid: {message}")]
    KeyInvalid {
        api: StorefrontApi,
        message: String,
        debug: Option<String>,
    },

    #[error("error calling out to {api} ({operation}): {message}")]
    Callout {
        api: StorefrontApi,
        operation: String,
        status: Option<u16>,
        message: String,
        debug: Option<String>,
    },

    #[error("{api} returned an invalid response ({operation}): {message}")]
    InvalidResponse {
        api: StorefrontApi,
        operation: String,
        message: String,
        debug: Option<String>,
    },

    #[error("invalid JWS: {message}")]
    InvalidJws {
        message: String,
        debug: Option<String>,
    },
}

impl StorefrontError {
    pub(crate) fn key_invalid(api: StorefrontApi, message: &str) -> Self {
        Self::KeyInvalid {
            api,
            message: message.to_owned(),
            debug: None,
        }
    }

    pub(crate) fn key_invalid_with_debug(
        api: StorefrontApi,
        message: &str,
        debug: &impl Debug,
    ) -> Self {
        Self::KeyInvalid {
            api,
            message: message.to_owned(),
            debug: Some(format!("{debug:?}")),
        }
    }

    pub(crate) fn callout_with_debug(
        api: StorefrontApi,
        operation: &str,
        message: &str,
        debug: &impl Debug,
    ) -> Self {
        Self::Callout {
            api,
            operation: operation.to_owned(),
            status: None,
            message: message.to_owned(),
            debug: Some(format!("{debug:?}")),
        }
    }

    pub(crate) fn status(api: StorefrontApi, operation: &str, status: u16, body: String) -> Self {
        Self::Callout {
            api,
            operation: operation.to_owned(),
            status: Some(status),
            message: format!("callout returned with {status} status code"),
            debug: Some(body),
        }
    }

    pub(crate) fn invalid_response(api: StorefrontApi, operation: &str, message: &str) -> Self {
        Self::InvalidResponse {
            api,
            operation: operation.to_owned(),
            message: message.to_owned(),
            debug: None,
        }
    }

    pub(crate) fn invalid_response_with_debug(
        api: StorefrontApi,
        operation: &str,
        message: &str,
        debug: &impl Debug,
    ) -> Self {
        Self::InvalidResponse {
            api,
            operation: operation.to_owned(),
            message: message.to_owned(),
            debug: Some(format!("{debug:?}")),
        }
    }

    pub(crate) fn invalid_jws(message: &str) -> Self {
        Self::InvalidJws {
            message: message.to_owned(),
            debug: None,
        }
    }

    pub(crate) fn invalid_jws_with_debug(message: &str, debug: &impl Debug) -> Self {
        Self::InvalidJws {
            message: message.to_owned(),
            debug: Some(format!("{debug:?}")),
        }
    }

    /// HTTP status code returned by the platform, if the callout got that far.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Callout { status, .. } => *status,
            _ => None,
        }
    }

    /// Rate limiting and server-side failures are worth retrying; everything
    /// else will fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self.status_code() {
            Some(429) => true,
            Some(code) => (500..600).contains(&code),
            None => false,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::KeyInvalid { .. }) || self.status_code() == Some(401)
    }
}

/// Errors raised by the document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate {collection} document for key '{key}'")]
    Duplicate { collection: &'static str, key: String },

    #[error("{collection} document '{id}' not found")]
    NotFound { collection: &'static str, id: String },

    #[error("failed to (de)serialize store snapshot: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Status of the compensating action taken when a payment went through but the
/// ledger could not record it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReversalStatus {
    /// The platform accepted the refund/revocation.
    Reversed { reference: String },
    /// The platform has no server-side refund; support must handle it.
    ManualReviewRequired,
    /// The reversal call itself failed.
    Failed { message: String },
}

/// Errors returned by ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("user '{0}' not found")]
    UserNotFound(String),

    #[error("plan '{0}' not found")]
    PlanNotFound(String),

    #[error("no subscription found for user '{0}'")]
    SubscriptionNotFound(String),

    #[error("purchase verification failed: {0}")]
    VerificationFailed(String),

    #[error("free trial is not available: {0}")]
    TrialUnavailable(String),

    #[error("not enough {kind} credits: {remaining} remaining, {requested} requested")]
    InsufficientCredits {
        kind: &'static str,
        remaining: i64,
        requested: i64,
    },

    #[error("daily ad reward limit reached")]
    RewardLimitReached,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("payment succeeded but could not be recorded ({source}); reversal: {reversal:?}")]
    PersistenceFailed {
        #[source]
        source: Box<LedgerError>,
        reversal: ReversalStatus,
    },

    #[error(transparent)]
    Storefront(#[from] StorefrontError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// HTTP-equivalent status for callers that expose these operations over
    /// an API.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::UserNotFound(_) | Self::PlanNotFound(_) | Self::SubscriptionNotFound(_) => 404,
            Self::VerificationFailed(_)
            | Self::TrialUnavailable(_)
            | Self::InvalidRequest(_)
            | Self::InsufficientCredits { .. } => 400,
            Self::RewardLimitReached => 429,
            Self::Storefront(_) => 502,
            Self::PersistenceFailed { .. } | Self::Store(_) => 500,
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
