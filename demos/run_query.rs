use std::error::Error;
use std::time::Duration;

use serf_rpc::rpc::proto::{QueryRecordType, QueryRequest};
use serf_rpc::{ConnectOptions, RpcClient};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let name = std::env::args().nth(1).unwrap_or_else(|| "uptime".to_string());
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let options = ConnectOptions::from_env()?.with_read_timeout(Duration::from_secs(30));
        let client = RpcClient::connect(options).await?;

        let params = QueryRequest::new(name, Vec::new())
            .with_request_ack(true)
            .with_timeout(Duration::from_secs(5));
        client
            .query(&params, |record| match record.kind {
                QueryRecordType::Ack => println!("ack from={}", record.from),
                _ => println!(
                    "response from={} payload={}",
                    record.from,
                    String::from_utf8_lossy(&record.payload).trim()
                ),
            })
            .await?;

        client.close().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
