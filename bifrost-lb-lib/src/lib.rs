#![forbid(unsafe_code)]

pub mod accesslog;
pub mod circuit;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod conntrack;
pub mod dns;
pub mod drain;
pub mod error;
pub mod health;
pub mod maps;
pub mod reload;
pub mod runtime;
pub mod target;
pub mod telemetry;
pub mod weights;

pub use config::{load_from_path, Config};
pub use error::{LbError, Result};
pub use maps::{MapHandle, MapSet, MemoryMap};
pub use runtime::ControlPlane;
pub use target::{Target, TargetGroup};
