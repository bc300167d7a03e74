use futures::StreamExt;
use scpictrl::{negotiate::starts_with, NegotiationConfig, Session, SessionConfig};
use std::pin::pin;

#[tokio::main]
async fn main() -> scpictrl::Result<()> {
    let path = "/dev/ttyUSB0".to_string();
    let negotiation = NegotiationConfig {
        validator: starts_with("FLUKE"),
        ..NegotiationConfig::default()
    };
    let session = Session::open(&path, &negotiation, SessionConfig::streaming()).await?;

    // Subscribe before sending so the first readings are not missed.
    let mut feed = pin!(session.subscribe()?);
    session.send_line("VAL1?").await?;

    while let Some(item) = feed.next().await {
        match item {
            Ok(response) => match response.value() {
                Some(value) => println!("Value: {}", value),
                None => println!("Line: {}", response.text),
            },
            Err(err) => {
                eprintln!("{}", err);
                break;
            }
        }
    }
    session.close().await;
    Ok(())
}
