//! These models represent the objects passed around by the agent
//!
//! There are several related formats we need to interact with:
//! - the internal message history the agent appends to as a session runs
//! - openai responses items, sent from the agent to the LLM
//! - tool content, returned by the systems executing computer actions
//!
//! The wire formats are converted to and from the internal structs at the
//! provider boundary. Because of the need for compatibility, the internal
//! models are not an exact match to any of these formats.
pub mod content;
pub mod message;
pub mod role;
pub mod tool;
