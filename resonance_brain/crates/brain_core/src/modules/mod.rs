pub mod coercion;
pub mod config;
pub mod param_registry;
pub mod patcher;
pub mod pipeline;
pub mod providers;
pub mod render;
pub mod response;
pub mod storage;
pub mod system_prompt;

pub use resonance_protocol as protocol;
