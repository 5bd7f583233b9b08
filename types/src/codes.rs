//! Error codes carried by [`MessageFault`](crate::MessageFault).
//!
//! Transport codes are reported by the transport collaborator; endpoint codes
//! are raised by the routing tree itself when it runs out of targets.

/// Connection to the target could not be established
pub const CONNECTION_FAILED: i32 = 101503;

/// Connection timed out while waiting for the target
pub const CONNECTION_TIMEOUT: i32 = 101504;

/// Connection was closed by the target before the exchange completed
pub const CONNECTION_CLOSED: i32 = 101505;

/// A load-balance endpoint found no active child
pub const LB_NONE_READY: i32 = 303000;

/// A recipient list found no ready recipient
pub const RL_NONE_READY: i32 = 303100;

/// A session-affinity endpoint could not route the session
pub const SAL_NOT_READY: i32 = 309000;

/// Transport-level timeout codes recognised when an endpoint defines none.
pub const DEFAULT_TIMEOUT_CODES: [i32; 2] = [CONNECTION_TIMEOUT, CONNECTION_CLOSED];
