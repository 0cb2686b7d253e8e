// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod http_backend;
pub mod sync_layer;
pub mod utils;

pub use utils::*;
