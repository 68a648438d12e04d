//! Transport plumbing: the framed reliable channel, the fixed-size datagram
//! channel, the send-rate limiter and the error taxonomy they share.

pub mod buffer;
pub mod datagram;
pub mod limiter;
pub mod reliable;
pub mod support;
