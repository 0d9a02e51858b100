//! Model provider implementations for Kestrel.
//!
//! All providers implement the `kestrel_core::Provider` trait.

pub mod factory;
pub mod openai_compat;

pub use factory::build_from_config;
pub use openai_compat::OpenAiCompatProvider;
