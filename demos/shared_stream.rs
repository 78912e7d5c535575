use price_stream_sdk::{BroadcastChannel, PriceStream, PriceUpdate, StreamConfig};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("Shared Connection Example");
    println!("=========================");

    let channel = BroadcastChannel::default();

    // One context owns the socket, the others follow it over the channel
    let owner = PriceStream::connect_shared(StreamConfig::from_env(), &channel)?;
    let followers: Vec<PriceStream> = (0..3).map(|_| PriceStream::follow(&channel)).collect();

    let mut tasks = Vec::new();
    for (i, follower) in followers.iter().enumerate() {
        let (handle, mut updates) = follower.subscribe_channel("eth")?;
        let follower = follower.clone();
        tasks.push(tokio::spawn(async move {
            let deadline = tokio::time::sleep(Duration::from_secs(20));
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    update = updates.recv() => match update {
                        Some(PriceUpdate::Price(price)) => println!("follower {} ETH ${:.2}", i, price),
                        Some(PriceUpdate::InvalidCoin) => {
                            println!("follower {} ETH not available", i);
                            break;
                        }
                        None => break,
                    },
                }
            }
            let _ = follower.unsubscribe(&handle).await;
        }));
    }

    for task in tasks {
        task.await?;
    }

    let status = owner.status().await?;
    println!("\nOwner {} handled {} envelopes from followers", status.context_id, status.metrics.envelopes_received);

    for follower in &followers {
        follower.close().await;
    }
    owner.close().await;
    Ok(())
}
