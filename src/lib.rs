pub mod catalog;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod query;
pub mod refresh;
pub mod schema;
pub mod server;

#[cfg(test)]
mod tests;

pub use refresh::CatalogState;
pub use server::ApiServer;
