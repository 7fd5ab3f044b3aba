pub mod error;
pub mod kv;

pub use error::*;
pub use kv::*;
