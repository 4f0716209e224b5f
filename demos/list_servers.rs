use std::error::Error;

use mcpproxy_sdk::api::ApiClient;
use secrecy::SecretString;

fn main() -> Result<(), Box<dyn Error>> {
    let base_url =
        std::env::var("MCPPROXY_URL").unwrap_or_else(|_| "https://localhost:8443".to_string());
    let api_key = std::env::var("MCPPROXY_API_KEY").ok();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut client = ApiClient::new(&base_url)?;
        if let Some(api_key) = api_key {
            client = client.with_api_key(SecretString::new(api_key));
        }

        let servers = client.get_servers().await?;
        for server in &servers {
            println!(
                "{} enabled={} connected={} tools={} {}",
                server.name,
                server.enabled,
                server.connected,
                server.tool_count,
                if server.last_error.is_empty() {
                    String::new()
                } else {
                    format!("last_error={}", server.last_error)
                },
            );
        }
        println!("{} server(s)", servers.len());

        Ok::<(), Box<dyn Error>>(())
    })
}
