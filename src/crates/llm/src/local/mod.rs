//! Local LLM provider implementations.
//!
//! Providers here run on localhost or the local network: no API key, lower
//! latency, no per-call cost.

pub mod ollama;

pub use ollama::OllamaClient;
