use crate::errors::ConfigError;

/// Environment keys holding credentials for the billing platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerSecret {
    GoogleServiceAccountKey,
    GooglePlayPackageName,
    AppleApiKeyId,
    AppleApiIssuerId,
    AppleApiPrivateKey,
    AppleBundleId,
    AppleAppId,
    AppleSharedSecret,
    StripeSecretKey,
    FirebaseProjectId,
    FirebaseServiceAccountKey,
}

impl LedgerSecret {
    pub const fn env_key(self) -> &'static str {
        match self {
            Self::GoogleServiceAccountKey => "GOOGLE_SERVICE_ACCOUNT_KEY",
            Self::GooglePlayPackageName => "GOOGLE_PLAY_PACKAGE_NAME",
            Self::AppleApiKeyId => "APPLE_API_KEY_ID",
            Self::AppleApiIssuerId => "APPLE_API_ISSUER_ID",
            Self::AppleApiPrivateKey => "APPLE_API_PRIVATE_KEY",
            Self::AppleBundleId => "APPLE_BUNDLE_ID",
            Self::AppleAppId => "APPLE_APP_ID",
            Self::AppleSharedSecret => "APPLE_SHARED_SECRET",
            Self::StripeSecretKey => "STRIPE_SECRET_KEY",
            Self::FirebaseProjectId => "FIREBASE_PROJECT_ID",
            Self::FirebaseServiceAccountKey => "FIREBASE_SERVICE_ACCOUNT_KEY",
        }
    }
}

/// Credentials for Google Play, the App Store, Stripe and Firebase.
#[derive(Clone)]
pub struct LedgerSecrets {
    /// Service account JSON with access to the Android Publisher API.
    pub google_service_account_key: String,
    pub google_play_package_name: String,
    pub apple_api_key_id: String,
    pub apple_api_issuer_id: String,
    /// PEM-encoded ES256 private key (.p8) from App Store Connect.
    pub apple_api_private_key: String,
    pub apple_bundle_id: String,
    /// Numeric App Store id of the app, used to list its subscription groups.
    pub apple_app_id: String,
    /// Shared secret for legacy receipt verification.
    pub apple_shared_secret: String,
    pub stripe_secret_key: String,
    pub firebase_project_id: String,
    /// Notifications are only logged when unset.
    pub firebase_service_account_key: Option<String>,
}

impl std::fmt::Debug for LedgerSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerSecrets")
            .field("google_play_package_name", &self.google_play_package_name)
            .field("apple_api_key_id", &self.apple_api_key_id)
            .field("apple_bundle_id", &self.apple_bundle_id)
            .field("apple_app_id", &self.apple_app_id)
            .field("firebase_project_id", &self.firebase_project_id)
            .finish_non_exhaustive()
    }
}

impl LedgerSecrets {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            google_service_account_key: required(LedgerSecret::GoogleServiceAccountKey)?,
            google_play_package_name: required(LedgerSecret::GooglePlayPackageName)?,
            apple_api_key_id: required(LedgerSecret::AppleApiKeyId)?,
            apple_api_issuer_id: required(LedgerSecret::AppleApiIssuerId)?,
            // .env files usually carry the key on one line with escaped
            // newlines.
            apple_api_private_key: required(LedgerSecret::AppleApiPrivateKey)?
                .replace("\\n", "\n"),
            apple_bundle_id: required(LedgerSecret::AppleBundleId)?,
            apple_app_id: required(LedgerSecret::AppleAppId)?,
            apple_shared_secret: required(LedgerSecret::AppleSharedSecret)?,
            stripe_secret_key: required(LedgerSecret::StripeSecretKey)?,
            firebase_project_id: required(LedgerSecret::FirebaseProjectId)?,
            firebase_service_account_key: optional(LedgerSecret::FirebaseServiceAccountKey),
        })
    }
}

fn required(secret: LedgerSecret) -> Result<String, ConfigError> {
    optional(secret).ok_or(ConfigError::Missing(secret.env_key()))
}

fn optional(secret: LedgerSecret) -> Option<String> {
    std::env::var(secret.env_key())
        .ok()
        .filter(|value| !value.trim().is_empty())
}
