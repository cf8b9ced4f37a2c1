use futures::StreamExt;
use log::{error, info};
use std::collections::HashMap;
use ws_relay::config::WsOptions;
use ws_relay::error::Error;
use ws_relay::event::Event;
use ws_relay::server::start_server_with_config;

// Small demonstration broker: every payload the transport decodes is echoed
// straight back through the session's writer.
#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let opts = WsOptions {
        port: 9222,
        compression: true,
        ..Default::default()
    };
    let (addr, mut events) = start_server_with_config(opts).await?;
    info!("websocket relay listening on {}", addr);

    let mut sessions = HashMap::new();
    while let Some(event) = events.next().await {
        match event {
            Event::NewClient(id, writer) => {
                info!("client {} connected", id);
                sessions.insert(id, writer);
            }
            Event::NewMessage(id, payload) => {
                if let Some(writer) = sessions.get(&id) {
                    if let Err(err) = writer.enqueue_message(payload) {
                        error!("client {}: {}", id, err);
                    }
                }
            }
            Event::Disconnect(id) => {
                info!("client {} disconnected", id);
                sessions.remove(&id);
            }
            Event::Error(id, err) => {
                error!("client {}: {}", id, err);
            }
        }
    }

    Ok(())
}
