/// Session fan-out payloads and leader-level errors.
pub mod messages;
/// Single-writer leader actor, pull loop, and push loop.
pub mod processor;
