use std::error::Error;

use mcpproxy_sdk::stream::client::StreamClient;
use mcpproxy_sdk::stream::proto::StreamEvent;
use secrecy::SecretString;

fn main() -> Result<(), Box<dyn Error>> {
    let base_url =
        std::env::var("MCPPROXY_URL").unwrap_or_else(|_| "https://localhost:8443".to_string());
    let api_key = std::env::var("MCPPROXY_API_KEY").ok();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut client = StreamClient::new(&base_url)?;
        if let Some(api_key) = api_key {
            client = client.with_api_key(SecretString::new(api_key));
        }

        let (stop, mut states, mut events) = client.spawn().split();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    stop.stop();
                }
                state = states.recv() => match state {
                    Some(state) => println!("connection: {state:?}"),
                    None => break,
                },
                event = events.recv() => match event {
                    Some(StreamEvent::Status(update)) => println!(
                        "status running={} listen_addr={} upstreams={} timestamp={}",
                        update.running,
                        update.listen_addr,
                        update.upstream_stats.len(),
                        update.timestamp,
                    ),
                    None => break,
                }
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
