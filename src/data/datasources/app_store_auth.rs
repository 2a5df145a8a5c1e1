use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;

use crate::{
    constants::APP_STORE_JWT_AUDIENCE,
    errors::{StorefrontApi, StorefrontError},
};

/// Bearer tokens for the App Store Server and App Store Connect APIs.
pub(crate) enum AppleToken {
    /// Signs a fresh ES256 token per request with an App Store Connect key.
    SigningKey {
        api: StorefrontApi,
        key_id: String,
        issuer_id: String,
        /// The App Store Server API requires `bid`; App Store Connect rejects
        /// it.
        bundle_id: Option<String>,
        key: EncodingKey,
    },
    #[cfg(test)]
    Static(String),
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    iat: i64,
    exp: i64,
    aud: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    bid: Option<&'a str>,
}

impl AppleToken {
    pub(crate) fn signing_key(
        api: StorefrontApi,
        private_key_pem: &str,
        key_id: &str,
        issuer_id: &str,
        bundle_id: Option<&str>,
    ) -> Result<Self, StorefrontError> {
        let key = EncodingKey::from_ec_pem(private_key_pem.as_bytes()).map_err(|e| {
            StorefrontError::key_invalid_with_debug(api, "private key is not a valid EC PEM", &e)
        })?;
        Ok(Self::SigningKey {
            api,
            key_id: key_id.to_owned(),
            issuer_id: issuer_id.to_owned(),
            bundle_id: bundle_id.map(str::to_owned),
            key,
        })
    }

    pub(crate) fn bearer(&self) -> Result<String, StorefrontError> {
        match self {
            #[cfg(test)]
            AppleToken::Static(token) => Ok(token.clone()),
            AppleToken::SigningKey {
                api,
                key_id,
                issuer_id,
                bundle_id,
                key,
            } => {
                let mut header = Header::new(Algorithm::ES256);
                header.kid = Some(key_id.clone());

                let now = chrono::Utc::now();
                let claims = Claims {
                    iss: issuer_id,
                    iat: now.timestamp(),
                    exp: (now + chrono::Duration::minutes(10)).timestamp(),
                    aud: APP_STORE_JWT_AUDIENCE,
                    bid: bundle_id.as_deref(),
                };

                jsonwebtoken::encode(&header, &claims, key).map_err(|e| {
                    StorefrontError::key_invalid_with_debug(*api, "failed to build JWT token", &e)
                })
            }
        }
    }
}
