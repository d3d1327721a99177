//! Bundled hooks

pub mod endpoint;
pub mod event;

pub use endpoint::{EndpointDef, EndpointHook, EndpointHookT, EndpointRequest, EndpointResponse};
pub use event::{event_syscalls, EventError, EventHook, EventHookT};
