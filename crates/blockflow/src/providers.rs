pub mod anthropic;
pub mod base;
pub mod cohere;
pub mod configs;
pub mod factory;
pub mod google;
pub mod openai;
pub mod openrouter;
pub mod sse;
pub mod utils;
