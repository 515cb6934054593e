use std::error::Error;

use rtm_sdk::stream::client::{GatewayClient, GatewayHandler, HookError};
use rtm_sdk::stream::outbound::Messenger;
use rtm_sdk::stream::proto::EventRecord;
use secrecy::SecretString;

struct EchoBot;

impl GatewayHandler for EchoBot {
    fn on_connect(&mut self, _messenger: &Messenger) -> Result<(), HookError> {
        println!("connected to gateway");
        Ok(())
    }

    fn on_event(&mut self, messenger: &Messenger, event: &EventRecord) -> Result<(), HookError> {
        if let Some(text) = event.text() {
            messenger.respond(event, format!("you said: {text}"))?;
        }
        Ok(())
    }

    fn on_disconnect(&mut self, _messenger: &Messenger) -> Result<(), HookError> {
        println!("disconnected from gateway");
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let token = std::env::var("RTM_TOKEN").unwrap_or_else(|_| "REPLACE_WITH_BOT_TOKEN".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let gateway = GatewayClient::new(SecretString::new(token)).launch(EchoBot)?;
        gateway.start()?;

        tokio::signal::ctrl_c().await?;
        gateway.stop()?;

        Ok::<(), Box<dyn Error>>(())
    })
}
