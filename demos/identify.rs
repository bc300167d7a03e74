use scpictrl::{negotiate, NegotiationConfig};

#[tokio::main]
async fn main() -> scpictrl::Result<()> {
    let path = "/dev/ttyUSB0".to_string();
    let result = negotiate(&path, &NegotiationConfig::default()).await?;
    eprintln!("Connected at {}\n", result.framing);
    match result.ident() {
        Ok(ident) => println!("{} {} ({})", ident.manufacturer, ident.model, ident.serial),
        Err(_) => println!("{}", result.identification),
    }
    Ok(())
}
