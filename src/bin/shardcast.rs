#[cfg(not(target_arch = "wasm32"))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    shardcast::cli::shardcast_cli(args).await
}

#[cfg(target_arch = "wasm32")]
fn main() {}
