pub mod capture_session;
pub mod capture_store;
pub mod dataset;
pub mod labels;
pub mod layer_bundler;
pub mod pool_builder;
pub mod utils;
