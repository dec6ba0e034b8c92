pub mod builder;
pub mod capsule;
pub mod config;
pub mod core;
pub mod decoder;
pub mod denoise;
pub mod error;
pub mod layers;
pub mod loss;
pub mod routing;
pub mod schedule;
pub mod votes;

// Main re-exports
pub use builder::ModelBuilder;
pub use capsule::{CapsuleGrid, ConvCapsLayer, PrimaryCapsLayer};
pub use config::{Device, LossConfig, NetworkConfig, RoutingKind};
pub use core::{CapsNet, CapsNetOutput, ForwardOptions};
pub use error::{CapsError, Result};
pub use loss::{CapsuleLoss, LossFunction, Metrics};
pub use routing::Routing;
pub use schedule::{LambdaSchedule, MarginSchedule, Schedule, Scheduler};
