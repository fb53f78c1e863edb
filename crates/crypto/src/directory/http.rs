//! HTTP key directory client.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use veilbox_shared::api::keys::{
    DirectoryErrorResponse, PublicKeyRecordResponse, PublishKeyRequest, REQUESTING_USER_HEADER,
};
use veilbox_shared::ids::{DeviceId, KeyRecordId, UserId};

use super::{KeyDirectoryService, PublicKeyRecord};
use crate::error::CryptoError;
use crate::primitives::PublicKey;

pub struct HttpKeyDirectory {
    base_url: String,
    http_client: Client,
    bearer_token: Option<String>,
}

impl HttpKeyDirectory {
    pub fn new(base_url: impl Into<String>) -> Result<Self, CryptoError> {
        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(|e| CryptoError::DirectoryError(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
            bearer_token: None,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn get_record(
        &self,
        path: String,
        user_id: &UserId,
        requesting_user_id: Option<&UserId>,
    ) -> Result<PublicKeyRecord, CryptoError> {
        let mut req = self.authorize(self.http_client.get(self.api_url(&path)));
        if let Some(requester) = requesting_user_id {
            req = req.header(REQUESTING_USER_HEADER, requester.to_string());
        }
        let resp = req.send().await?;
        record_from_response(resp, user_id).await
    }
}

async fn record_from_response(
    resp: Response,
    user_id: &UserId,
) -> Result<PublicKeyRecord, CryptoError> {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return Err(CryptoError::KeyNotFound {
            user_id: user_id.to_string(),
        });
    }
    if !status.is_success() {
        let detail = match resp.json::<DirectoryErrorResponse>().await {
            Ok(body) => body.error,
            Err(_) => format!("HTTP {status}"),
        };
        if status.is_server_error() {
            return Err(CryptoError::DirectoryUnavailable(detail));
        }
        return Err(CryptoError::DirectoryError(detail));
    }
    let body: PublicKeyRecordResponse = resp.json().await?;
    PublicKeyRecord::try_from(body)
}

#[async_trait]
impl KeyDirectoryService for HttpKeyDirectory {
    async fn publish(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        public_key: &PublicKey,
    ) -> Result<PublicKeyRecord, CryptoError> {
        let url = self.api_url(&format!("/api/keys/{user_id}/devices/{device_id}"));
        let resp = self
            .authorize(self.http_client.put(url))
            .json(&PublishKeyRequest {
                public_key: public_key.to_base64(),
            })
            .send()
            .await?;
        let record = record_from_response(resp, user_id).await?;
        if record.public_key != *public_key {
            return Err(CryptoError::DirectoryError(
                "directory echoed a different key than was published".into(),
            ));
        }
        Ok(record)
    }

    async fn fetch_latest(
        &self,
        user_id: &UserId,
        requesting_user_id: &UserId,
    ) -> Result<PublicKeyRecord, CryptoError> {
        tracing::debug!(user_id = %user_id, "fetching latest key");
        self.get_record(
            format!("/api/keys/{user_id}/latest"),
            user_id,
            Some(requesting_user_id),
        )
        .await
    }

    async fn fetch_record(
        &self,
        user_id: &UserId,
        record_id: &KeyRecordId,
    ) -> Result<PublicKeyRecord, CryptoError> {
        tracing::debug!(user_id = %user_id, record_id = %record_id, "fetching key record");
        self.get_record(format!("/api/keys/{user_id}/records/{record_id}"), user_id, None)
            .await
    }

    async fn fetch_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<PublicKeyRecord, CryptoError> {
        tracing::debug!(user_id = %user_id, device_id = %device_id, "fetching device key");
        self.get_record(format!("/api/keys/{user_id}/devices/{device_id}"), user_id, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let directory = HttpKeyDirectory::new("http://localhost:3000/").unwrap();
        assert_eq!(
            directory.api_url("/api/keys"),
            "http://localhost:3000/api/keys"
        );
    }

    #[tokio::test]
    async fn unreachable_directory_is_retryable() {
        // Port 9 (discard) on localhost is closed in test environments.
        let directory = HttpKeyDirectory::new("http://127.0.0.1:9").unwrap();
        let err = directory
            .fetch_latest(&UserId::new(), &UserId::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err:?}");
    }
}
