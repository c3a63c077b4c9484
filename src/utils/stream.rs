use std::pin::Pin;

use futures::Stream;

#[cfg(not(target_arch = "wasm32"))]
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
#[cfg(target_arch = "wasm32")]
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

#[cfg(not(target_arch = "wasm32"))]
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + 'a>>;
#[cfg(target_arch = "wasm32")]
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = T> + 'a>>;

/// Pin-box a stream or future into the matching `Box*` alias. The target
/// type is taken from the surrounding context, so both aliases work on both
/// targets without repeating the cfg split at every call site.
#[macro_export]
macro_rules! boxed {
    ($e:expr) => {
        Box::pin($e)
    };
}
