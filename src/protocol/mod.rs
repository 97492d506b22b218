//! Wire types for both sides of the proxy.

pub mod openai;
pub mod upstream;
