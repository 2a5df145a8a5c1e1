use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use yup_oauth2::{parse_service_account_key, ServiceAccountAuthenticator, ServiceAccountKey};

use crate::errors::{StorefrontApi, StorefrontError};

/// Google access tokens live for an hour; refresh a little before that.
fn token_lifetime() -> Duration {
    Duration::minutes(50)
}

/// Bearer tokens for Google APIs, minted from a service account.
pub(crate) enum GoogleAccessToken {
    ServiceAccount {
        api: StorefrontApi,
        key: ServiceAccountKey,
        scope: &'static str,
        cached: Mutex<Option<(String, DateTime<Utc>)>>,
    },
    #[cfg(test)]
    Static(String),
}

impl GoogleAccessToken {
    pub(crate) fn service_account(
        api: StorefrontApi,
        service_account_json: &str,
        scope: &'static str,
    ) -> Result<Self, StorefrontError> {
        let key = parse_service_account_key(service_account_json).map_err(|e| {
            StorefrontError::key_invalid_with_debug(
                api,
                "service account key could not be parsed",
                &e,
            )
        })?;
        Ok(Self::ServiceAccount {
            api,
            key,
            scope,
            cached: Mutex::new(None),
        })
    }

    pub(crate) async fn bearer(&self) -> Result<String, StorefrontError> {
        match self {
            #[cfg(test)]
            GoogleAccessToken::Static(token) => Ok(token.clone()),
            GoogleAccessToken::ServiceAccount {
                api,
                key,
                scope,
                cached,
            } => {
                let mut cached = cached.lock().await;
                if let Some((token, minted_at)) = cached.as_ref() {
                    if Utc::now() - *minted_at < token_lifetime() {
                        return Ok(token.clone());
                    }
                }
                let token = Self::build_access_token(*api, key.clone(), scope).await?;
                *cached = Some((token.clone(), Utc::now()));
                Ok(token)
            }
        }
    }

    async fn build_access_token(
        api: StorefrontApi,
        key: ServiceAccountKey,
        scope: &str,
    ) -> Result<String, StorefrontError> {
        let authenticator = ServiceAccountAuthenticator::builder(key)
            .build()
            .await
            .map_err(|e| {
                StorefrontError::key_invalid_with_debug(
                    api,
                    "service account authenticator could not be built",
                    &e,
                )
            })?;
        Ok(authenticator
            .token(&[scope])
            .await
            .map_err(|e| {
                StorefrontError::key_invalid_with_debug(
                    api,
                    "service account token could not be built",
                    &e,
                )
            })?
            .token()
            .ok_or_else(|| StorefrontError::key_invalid(api, "service account token is empty"))?
            .to_string())
    }
}
