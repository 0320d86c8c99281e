//! Manpower-request record collaborator.
//!
//! Records live in the recruitment API; this worker only asks it to clone
//! an existing request.

use std::future::Future;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::error::RecordError;

/// The fields of a created manpower request this worker cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManpowerRequest {
    pub id: Uuid,
    #[serde(default)]
    pub document_number: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

pub trait ManpowerRequests: Send + Sync + 'static {
    /// Create a new manpower request copied from `clone_id`.
    fn create_from_clone(
        &self,
        clone_id: Uuid,
    ) -> impl Future<Output = Result<ManpowerRequest, RecordError>> + Send;
}

/// Recruitment API client.
#[derive(Clone)]
pub struct HttpManpowerRequests {
    client: Client,
    base_url: String,
}

impl HttpManpowerRequests {
    pub fn new(client: Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(client: Client, config: &Config) -> Self {
        Self::new(client, config.recruitment_api_url.clone())
    }

    fn clone_url(&self, clone_id: Uuid) -> String {
        format!("{}/manpower-requests/{}/clone", self.base_url, clone_id)
    }
}

impl ManpowerRequests for HttpManpowerRequests {
    async fn create_from_clone(&self, clone_id: Uuid) -> Result<ManpowerRequest, RecordError> {
        let response = self.client.post(self.clone_url(clone_id)).send().await?;

        match response.status() {
            status if status.is_success() => {
                let record: ManpowerRequest = response.json().await?;
                info!(
                    clone_id = %clone_id,
                    record_id = %record.id,
                    document_number = ?record.document_number,
                    "manpower_request_cloned"
                );
                Ok(record)
            }
            StatusCode::NOT_FOUND => Err(RecordError::NotFound(clone_id.to_string())),
            status => Err(RecordError::Rejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}
