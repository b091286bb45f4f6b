pub mod config;
pub mod index;
pub mod model;
pub mod search;
pub mod source;
pub mod strategy;
pub mod tasks;
pub mod util;
pub mod writer;

pub(crate) use serde_json as json;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .json()
        .with_target(false)
        .without_time()
        .init();
}
