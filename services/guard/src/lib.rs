//! SessionGuard
//!
//! Host-resident packet filter for peer-to-peer game sessions. Inbound game
//! traffic is classified by payload signature and admitted according to the
//! current session mode; outbound traffic always passes.

pub mod capture;
pub mod classifier;
pub mod control;
pub mod filter_loop;
pub mod packet;
pub mod policy;
pub mod runtime;
pub mod service_ranges;
pub mod session;
pub mod settings;
pub mod signature;
pub mod whitelist;

#[cfg(test)]
mod tests;

pub use capture::{
    CaptureProvider, CapturedPacket, ChannelCapture, FilterExpression, PacketCapture,
};
pub use classifier::PacketClassifier;
pub use control::{Command, ControlSurface, Reply};
pub use filter_loop::{FilteringLoop, LoopReport, StopSignal};
pub use packet::{Direction, PacketDescriptor, Protocol};
pub use policy::{Decision, PolicyEngine};
pub use runtime::{GuardHandle, GuardRuntime};
pub use session::{SessionMode, SessionModeStateMachine};
pub use settings::GuardSettings;
pub use signature::{SignatureTable, TrafficClass};
pub use whitelist::WhitelistStore;
