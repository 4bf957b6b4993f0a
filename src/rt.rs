//! Executor-agnostic spawn: `tokio::spawn` natively, `wasm_bindgen_futures::spawn_local`
//! on wasm32, mirroring the dual-target split the rest of the crate's
//! dependencies already follow.

use std::future::Future;

#[cfg(not(target_arch = "wasm32"))]
pub fn spawn<F>(fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(fut);
}

#[cfg(target_arch = "wasm32")]
pub fn spawn<F>(fut: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(fut);
}

#[cfg(not(target_arch = "wasm32"))]
pub async fn sleep_until(deadline: std::time::Instant) {
    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
}

#[cfg(target_arch = "wasm32")]
pub async fn sleep_until(deadline: std::time::Instant) {
    let now = std::time::Instant::now();
    let remaining = deadline.saturating_duration_since(now);
    gloo_timers::future::TimeoutFuture::new(remaining.as_millis() as u32).await;
}
