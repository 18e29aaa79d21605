use std::error::Error;

use serf_rpc::rpc::proto::StreamEvent;
use serf_rpc::{ConnectOptions, RpcClient};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = RpcClient::connect(ConnectOptions::from_env()?).await?;
        for member in client.members().await? {
            println!(
                "member name={} addr={:?} status={}",
                member.name,
                member.ip_addr(),
                member.status
            );
        }

        let (_ack, mut events) = client.stream(["member-join", "member-leave", "user"]).await?;
        while let Some(event) = events.recv().await {
            match event? {
                StreamEvent::User { name, payload, .. } => {
                    println!("user event name={name} payload={}", String::from_utf8_lossy(&payload));
                    if name == "stop-demo" {
                        events.stop().await?;
                    }
                }
                StreamEvent::MemberJoin { members } | StreamEvent::MemberLeave { members } => {
                    for member in members {
                        println!("membership change name={} status={}", member.name, member.status);
                    }
                }
                other => println!("event {other:?}"),
            }
        }

        client.close().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
