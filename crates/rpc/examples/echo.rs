//! Serve an echo service and call it once.
//!
//! ```text
//! cargo run -p knot-rpc --example echo
//! ```

use knot_rpc::{MethodTable, RpcClient, RpcServer, Service};
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Echo;

impl Echo {
    fn echo(&self, value: Value) -> Value {
        value
    }

    fn shout(&self, text: String) -> String {
        text.to_uppercase()
    }
}

impl Service for Echo {
    fn methods(table: &mut MethodTable<Self>) {
        table.method("Echo", Self::echo).method("Shout", Self::shout);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut server = RpcServer::new();
    server.register(Echo);
    let server = server.start("127.0.0.1:0").await?;

    let client = RpcClient::dial(&server.local_addr().to_string()).await?;

    let echoed = client.call(vec![json!("Echo.Echo"), json!("hello")]).await?;
    info!(?echoed, "echo");

    let shouted = client.call(vec![json!("Echo.Shout"), json!("hello")]).await?;
    info!(?shouted, "shout");

    client.close();
    client.closed().await;
    server.shutdown();
    Ok(())
}
