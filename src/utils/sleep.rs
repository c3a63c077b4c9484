#[cfg(target_arch = "wasm32")]
pub async fn sleep(millis: u64) {
    gloo_timers::future::sleep(std::time::Duration::from_millis(millis)).await;
}

#[cfg(not(target_arch = "wasm32"))]
pub async fn sleep(millis: u64) {
    tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
}
