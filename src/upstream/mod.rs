pub mod client;
pub mod translator;

pub use client::UpstreamClient;
pub use translator::{translate, TranslatedRequest};
