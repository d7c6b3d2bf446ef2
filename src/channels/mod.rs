//! Outbound channel gateway and resilient delivery.
//!
//! The gateway is an opaque transport: it sends one text, image or document
//! payload to a destination and reports success. Retry, ordering and
//! persistence of outcomes live in [`delivery`].

pub mod cli;
pub mod delivery;
pub mod http;

pub use cli::CliGateway;
pub use delivery::{AttachmentResult, DeliveryLayer, DeliveryReport};
pub use http::HttpGateway;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Gateway acknowledgement for a sent payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Channel-native id of the sent message, when the gateway reports one.
    pub message_id: Option<String>,
}

/// Media sent after the reply text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attachment {
    Image {
        url: String,
        caption: Option<String>,
    },
    Document {
        base64: String,
        filename: String,
        caption: Option<String>,
    },
}

impl Attachment {
    pub fn image(url: impl Into<String>, caption: Option<String>) -> Self {
        Self::Image {
            url: url.into(),
            caption,
        }
    }

    /// Reference stored on the outbound message record.
    pub fn reference(&self) -> &str {
        match self {
            Self::Image { url, .. } => url,
            Self::Document { filename, .. } => filename,
        }
    }

    pub fn caption(&self) -> Option<&str> {
        match self {
            Self::Image { caption, .. } | Self::Document { caption, .. } => caption.as_deref(),
        }
    }
}

/// Outbound transport to a chat channel.
#[async_trait]
pub trait ChannelGateway: Send + Sync {
    /// Channel name, for logs and errors.
    fn name(&self) -> &str;

    async fn send_text(&self, destination: &str, text: &str) -> Result<SendReceipt, ChannelError>;

    async fn send_image(
        &self,
        destination: &str,
        url: &str,
        caption: Option<&str>,
    ) -> Result<SendReceipt, ChannelError>;

    async fn send_document(
        &self,
        destination: &str,
        base64: &str,
        filename: &str,
        caption: Option<&str>,
    ) -> Result<SendReceipt, ChannelError>;

    /// Send one attachment through the matching payload method.
    async fn send_attachment(
        &self,
        destination: &str,
        attachment: &Attachment,
    ) -> Result<SendReceipt, ChannelError> {
        match attachment {
            Attachment::Image { url, caption } => {
                self.send_image(destination, url, caption.as_deref()).await
            }
            Attachment::Document {
                base64,
                filename,
                caption,
            } => {
                self.send_document(destination, base64, filename, caption.as_deref())
                    .await
            }
        }
    }
}
