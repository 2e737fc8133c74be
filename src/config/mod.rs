//! Configuration models for the dispatcher and its worker pool.

pub mod dispatcher;

pub use dispatcher::DispatcherConfig;
