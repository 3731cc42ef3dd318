//! Translation between the Anthropic Messages API and the `OpenAI` Chat Completions API.
//!
//! Everything in here is pure: requests, responses, stream chunks and backend errors go
//! in, their counterparts come out. No I/O.

pub mod anthropic_types;
pub mod errors;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod streaming;
