use price_stream_sdk::{PriceStream, PriceUpdate, StreamConfig};
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,price_stream_sdk=debug")),
        )
        .init();

    println!("CryptoCompare Streaming Example");
    println!("===============================");

    // CRYPTOCOMPARE_API_KEY is appended to the socket URL when set
    let stream = PriceStream::connect(StreamConfig::from_env())?;

    // DOGE falls back to the BTC pair, NOTACOIN is rejected in both forms
    let mut handles = Vec::new();
    for symbol in ["btc", "eth", "doge", "notacoin"] {
        let label = symbol.to_uppercase();
        handles.push(stream.subscribe(symbol, move |update| match update {
            PriceUpdate::Price(price) => println!("{:<10} ${:<12.6}", label, price),
            PriceUpdate::InvalidCoin => println!("{:<10} not available", label),
        })?);
    }

    for _ in 0..6 {
        sleep(Duration::from_secs(5)).await;

        let status = stream.status().await?;
        println!("\n{:-<50}", "");
        println!("Connection: {:?}", status.connection);
        println!("Active keys: {}", status.active_keys.join(", "));
        println!("USD/BTC rate: {:?}", status.cross_rate);
        println!(
            "Frames: {} received, {} dropped",
            status.metrics.frames_received, status.metrics.frames_dropped
        );
        println!("{:-<50}\n", "");
    }

    for handle in &handles {
        stream.unsubscribe(handle).await?;
    }

    let health = stream.health_check().await;
    println!("Health: {:?} ({})", health.status, health.message.unwrap_or_default());

    stream.close().await;
    Ok(())
}
