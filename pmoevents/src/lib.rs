//! # pmoevents - Typed event bus
//!
//! Synchronous publish/subscribe primitive used by the relay layers to
//! propagate stream and station notifications.
//!
//! - Listeners are ordered by ascending priority, ties keep insertion order
//! - `publish` runs listeners on the calling thread before returning
//! - A listener can stop propagation for the current `publish` call
//! - One-shot listeners are removed before their single invocation
//! - After `teardown`, every operation fails with [`BusError::TornDown`]

pub mod bus;
pub mod error;

pub use bus::{
    BusEvent, Dispatch, EventBus, ListenerId, ListenerRef, SubscribeOptions, Subscription,
};
pub use error::{BusError, Result};
