//! Control-channel protocol: typed messages and the blocking client

pub mod client;
pub mod message;

pub use client::{ControlChannel, DelayPoller, ServiceClient};
pub use message::{Indication, Message, MessageName, Request, Response};
