//! HTTP chat gateway client.
//!
//! Posts JSON to `{base_url}/send/text`, `/send/image` and `/send/document`.
//! A 2xx response is success; the body may carry `{"messageId": "..."}`.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::channels::{ChannelGateway, SendReceipt};
use crate::error::ChannelError;

const NAME: &str = "http";

pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    #[serde(default)]
    message_id: Option<String>,
}

impl HttpGateway {
    pub fn new(base_url: &str, token: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/send/{path}", self.base_url)
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<SendReceipt, ChannelError> {
        let mut request = self.client.post(self.url(path)).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let resp = request
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(ChannelError::RateLimited { name: NAME.into() });
        }
        if !status.is_success() {
            let err = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: NAME.into(),
                reason: format!("send/{path} status={status}: {err}"),
            });
        }

        // Some gateways answer with an empty body.
        let parsed: SendResponse = resp.json().await.unwrap_or_default();
        Ok(SendReceipt {
            message_id: parsed.message_id,
        })
    }
}

fn check_destination(destination: &str) -> Result<(), ChannelError> {
    if destination.trim().is_empty() {
        return Err(ChannelError::InvalidDestination(destination.to_string()));
    }
    Ok(())
}

#[async_trait]
impl ChannelGateway for HttpGateway {
    fn name(&self) -> &str {
        NAME
    }

    async fn send_text(&self, destination: &str, text: &str) -> Result<SendReceipt, ChannelError> {
        check_destination(destination)?;
        self.post(
            "text",
            serde_json::json!({ "to": destination, "text": text }),
        )
        .await
    }

    async fn send_image(
        &self,
        destination: &str,
        url: &str,
        caption: Option<&str>,
    ) -> Result<SendReceipt, ChannelError> {
        check_destination(destination)?;
        self.post(
            "image",
            serde_json::json!({ "to": destination, "url": url, "caption": caption }),
        )
        .await
    }

    async fn send_document(
        &self,
        destination: &str,
        base64: &str,
        filename: &str,
        caption: Option<&str>,
    ) -> Result<SendReceipt, ChannelError> {
        check_destination(destination)?;
        self.post(
            "document",
            serde_json::json!({
                "to": destination,
                "base64": base64,
                "filename": filename,
                "caption": caption,
            }),
        )
        .await
    }
}
