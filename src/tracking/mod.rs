//! Background tasks following one order and the positions around it.

pub mod location;
pub mod poller;
pub mod task;

pub use location::{ChannelLocationSource, FixedLocationSource, LocationSource};
pub use poller::{OrderWatch, WatchEffect, WatchScreen};
pub use task::{Liveness, TaskHandle};
