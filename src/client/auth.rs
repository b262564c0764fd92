use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use gcp_bigquery_client::auth::Authenticator;
use gcp_bigquery_client::error::BQError;
use gcp_bigquery_client::yup_oauth2::authenticator::{
    ApplicationDefaultCredentialsTypes, DefaultAuthenticator,
};
use gcp_bigquery_client::yup_oauth2::{
    self, ApplicationDefaultCredentialsAuthenticator, ApplicationDefaultCredentialsFlowOpts,
    ServiceAccountAuthenticator, ServiceAccountKey,
};
use tracing::debug;

use crate::error::{BigqueryError, Result};

/// OAuth scope covering both the REST and the Storage APIs
pub const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";

/// Resolved authentication material for a warehouse connection.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Service account key JSON
    ServiceAccountKey(String),
    ServiceAccountKeyFile(PathBuf),
    /// Whatever the environment provides (metadata server, gcloud, GOOGLE_APPLICATION_CREDENTIALS)
    ApplicationDefault,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::ServiceAccountKey(_) => f.write_str("ServiceAccountKey(<redacted>)"),
            Credentials::ServiceAccountKeyFile(path) => {
                f.debug_tuple("ServiceAccountKeyFile").field(path).finish()
            }
            Credentials::ApplicationDefault => f.write_str("ApplicationDefault"),
        }
    }
}

impl Credentials {
    /// Load the key material without contacting the token endpoint.
    async fn service_account_key(&self) -> Result<Option<ServiceAccountKey>> {
        match self {
            Credentials::ServiceAccountKey(json) => yup_oauth2::parse_service_account_key(json)
                .map(Some)
                .map_err(|e| BigqueryError::Auth(format!("Invalid service account key JSON: {e}"))),
            Credentials::ServiceAccountKeyFile(path) => {
                yup_oauth2::read_service_account_key(path)
                    .await
                    .map(Some)
                    .map_err(|e| {
                        BigqueryError::Auth(format!(
                            "Cannot read service account key {}: {e}",
                            path.display()
                        ))
                    })
            }
            Credentials::ApplicationDefault => Ok(None),
        }
    }
}

/// Access tokens for one connection, shared by the REST client and the storage channels.
#[derive(Clone)]
pub struct TokenSource {
    auth: DefaultAuthenticator,
}

impl TokenSource {
    pub async fn from_credentials(credentials: &Credentials) -> Result<Arc<Self>> {
        let auth = match credentials.service_account_key().await? {
            Some(key) => ServiceAccountAuthenticator::builder(key).build().await,
            None => {
                match ApplicationDefaultCredentialsAuthenticator::builder(
                    ApplicationDefaultCredentialsFlowOpts::default(),
                )
                .await
                {
                    ApplicationDefaultCredentialsTypes::ServiceAccount(builder) => {
                        builder.build().await
                    }
                    ApplicationDefaultCredentialsTypes::InstanceMetadata(builder) => {
                        builder.build().await
                    }
                }
            }
        }
        .map_err(|e| BigqueryError::Auth(format!("Failed to create authenticator: {e}")))?;
        debug!(credentials = ?credentials, "Token source ready");
        Ok(Arc::new(Self { auth }))
    }

    /// Bearer token, refreshed by the authenticator when close to expiry.
    pub async fn token(&self) -> Result<String> {
        self.access_token()
            .await
            .map_err(|e| BigqueryError::Auth(e.to_string()))
    }
}

#[async_trait]
impl Authenticator for TokenSource {
    async fn access_token(&self) -> std::result::Result<String, BQError> {
        Ok(self
            .auth
            .token(&[BIGQUERY_SCOPE])
            .await?
            .token()
            .ok_or(BQError::NoToken)?
            .to_string())
    }
}
