//! Control & Progress Surface: a local WebSocket endpoint that pushes
//! configuration and progress and accepts start/pause/resume/cancel
//! commands (§4.7). Workers and the Supervisor publish to this surface over
//! channels; the surface never reaches back into them (§9).

#![deny(unsafe_code)]

mod command;
mod events;
mod progress;
mod server;

pub use command::Command;
pub use events::OutboundFrame;
pub use progress::{JobSnapshot, ProgressSource, ProgressTicker};
pub use server::ControlSurface;
