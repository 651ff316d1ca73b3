//! These models represent the conversation state each agent owns
//!
//! - `Message` is one role/content record with the metadata we keep around it
//!   (chosen flag, parameter version reference, raw log reference)
//! - `Turn` is one position in a timeline, either a single message or a branch of
//!   alternate replies produced by re-asking
//! - `Timeline` is the ordered list of turns, and knows how to flatten itself into
//!   the outbound context sent to a provider
pub mod message;
pub mod role;
pub mod turn;
