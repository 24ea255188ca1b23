use std::error::Error;

use gateway_transport::rest::client::{RequestDescriptor, RestClient};
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct MessageMsg {
    id: String,
    channel_id: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let token = "REPLACE_WITH_BOT_TOKEN".to_string();
    let channel_id = "REPLACE_WITH_CHANNEL_ID";

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = RestClient::new(SecretString::new(token))?;
        let request = RequestDescriptor::post(format!("/channels/{channel_id}/messages"))
            .json(json!({"content": "hello from the transport layer"}));

        let message: MessageMsg = client.execute_json(&request).await?;
        println!("sent message id={} channel={}", message.id, message.channel_id);
        Ok::<(), Box<dyn Error>>(())
    })?;

    Ok(())
}
