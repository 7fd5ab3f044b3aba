pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod types;

#[cfg(test)]
pub mod tests;

pub use config::*;
pub use coordinator::*;
pub use credentials::*;
pub use types::*;
