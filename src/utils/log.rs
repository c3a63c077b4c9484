//! Cross-target logging macros.
//!
//! Native builds forward to the `log` facade (the CLI installs `env_logger`);
//! wasm builds write to the worker console.

#[cfg(not(target_arch = "wasm32"))]
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => { ::log::debug!($($arg)*) };
}

#[cfg(not(target_arch = "wasm32"))]
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => { ::log::info!($($arg)*) };
}

#[cfg(not(target_arch = "wasm32"))]
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => { ::log::warn!($($arg)*) };
}

#[cfg(target_arch = "wasm32")]
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => { ::web_sys::console::debug_1(&format!($($arg)*).into()) };
}

#[cfg(target_arch = "wasm32")]
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => { ::web_sys::console::info_1(&format!($($arg)*).into()) };
}

#[cfg(target_arch = "wasm32")]
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => { ::web_sys::console::warn_1(&format!($($arg)*).into()) };
}
