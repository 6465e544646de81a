//! Agent-to-agent handoffs.
//!
//! An agent requests a handoff with a `handoff` or `transfer_to_<agent>` tool
//! call. The [`HandoffRouter`] checks the request against the chain so far,
//! the caller's permitted targets and the shared [`HandoffBudget`], then runs
//! the target in a child session with the (optionally filtered) conversation.

pub mod budget;
pub mod filter;
pub mod router;

pub use budget::HandoffBudget;
pub use filter::{drop_tool_calls, keep_last, user_only, FilterRegistry, InputFilter};
pub use router::{HandoffRequest, HandoffResult, HandoffRouter, HandoffState, HANDOFF_SOURCE_KEY};
