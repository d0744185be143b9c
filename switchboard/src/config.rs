//! Compile-time limits of the IPC core.

/// Maximum number of unanswered asynchronous calls per phone.
pub const MAX_ASYNC_CALLS: usize = 4;

/// Number of argument words carried by a call.
pub const IPC_CALL_LEN: usize = 6;

/// Number of argument words carried by a buffer message.
pub const IPC_MESSAGE_ARGS: usize = 6;

/// Largest message an IPC buffer accepts, excluding the message header.
pub const IPC_MAX_MESSAGE_LEN: usize = 4096;

/// Largest blob a task can create.
pub const IPC_BLOB_SIZE_LIMIT: usize = 65536;

/// Capacity of a task's capability table.
pub const MAX_CAPABILITIES: usize = 4096;
