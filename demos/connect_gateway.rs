use std::error::Error;

use gateway_transport::gateway::client::{GatewayClient, GatewayEvent};
use secrecy::SecretString;
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// GUILDS | GUILD_MESSAGES
const INTENTS: u64 = (1 << 0) | (1 << 9);

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let token = "REPLACE_WITH_BOT_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = GatewayClient::new(SecretString::new(token)).with_intents(INTENTS);
        let mut connection = client.connect().await?;
        let sender = connection.sender();

        while let Some(event) = connection.recv().await {
            match event {
                GatewayEvent::Dispatch { name, sequence, .. } if name == "READY" => {
                    println!("ready seq={sequence:?}");
                    sender.update_presence(json!({
                        "since": null,
                        "activities": [],
                        "status": "online",
                        "afk": false
                    }))?;
                }
                GatewayEvent::Dispatch { name, sequence, .. } => {
                    println!("dispatch {name} seq={sequence:?}");
                }
                GatewayEvent::Reconnecting { resume, delay } => {
                    println!("reconnecting resume={resume} in {delay:?}");
                }
                GatewayEvent::Error(err) => eprintln!("gateway error: {err}"),
                _ => {}
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })?;

    Ok(())
}
