// ABOUTME: Test doubles for handlers and repliers.
// ABOUTME: Lets sessions and registries be exercised without a chat transport.

pub mod recording;

pub use recording::{FailingHandler, RecordingHandler, RecordingReplier};
