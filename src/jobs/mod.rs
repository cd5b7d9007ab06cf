pub mod apply_retry;
pub mod cleanup;
pub mod poller;
