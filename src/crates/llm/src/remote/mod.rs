//! Remote LLM provider implementations.
//!
//! Providers here speak an OpenAI-compatible chat completions API over
//! HTTPS and require an API key.

pub mod openai;

pub use openai::OpenAiClient;
