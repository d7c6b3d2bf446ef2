//! CLI gateway: prints outbound payloads to stdout for local runs.

use async_trait::async_trait;

use crate::channels::{ChannelGateway, SendReceipt};
use crate::error::ChannelError;

/// Gateway that writes every payload to stdout.
pub struct CliGateway;

impl CliGateway {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CliGateway {
    fn default() -> Self {
        Self::new()
    }
}

fn receipt() -> SendReceipt {
    SendReceipt {
        message_id: Some(uuid::Uuid::new_v4().to_string()),
    }
}

#[async_trait]
impl ChannelGateway for CliGateway {
    fn name(&self) -> &str {
        "cli"
    }

    async fn send_text(&self, destination: &str, text: &str) -> Result<SendReceipt, ChannelError> {
        println!("\n→ {destination}\n{text}\n");
        Ok(receipt())
    }

    async fn send_image(
        &self,
        destination: &str,
        url: &str,
        caption: Option<&str>,
    ) -> Result<SendReceipt, ChannelError> {
        match caption {
            Some(c) => println!("→ {destination} [image] {url} ({c})"),
            None => println!("→ {destination} [image] {url}"),
        }
        Ok(receipt())
    }

    async fn send_document(
        &self,
        destination: &str,
        base64: &str,
        filename: &str,
        caption: Option<&str>,
    ) -> Result<SendReceipt, ChannelError> {
        println!(
            "→ {destination} [document] {filename} ({} bytes b64){}",
            base64.len(),
            caption.map(|c| format!(" {c}")).unwrap_or_default()
        );
        Ok(receipt())
    }
}
