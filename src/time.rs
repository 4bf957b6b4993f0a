//! Wall-clock milliseconds since the Unix epoch, shared by every component
//! that stamps a session or in-flight request.

#[cfg(not(target_arch = "wasm32"))]
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// `std::time::SystemTime::now()` panics on wasm32-unknown-unknown; the rest
/// of this corpus's wasm targets read the clock through `js_sys::Date::now()`.
#[cfg(target_arch = "wasm32")]
pub fn now_millis() -> u64 {
    js_sys::Date::now() as u64
}
