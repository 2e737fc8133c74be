//! API surface for embedding the dispatcher in a service.

pub mod api;

pub use api::{health, submit_request, Health, SubmitRequest, SubmitResponse, TaskOutcome};
