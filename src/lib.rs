pub mod equipment;
pub mod error;
pub mod model;
pub mod protocol;
pub mod resource;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
