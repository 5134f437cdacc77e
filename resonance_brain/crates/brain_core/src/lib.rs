pub mod modules;

pub use modules::{
    coercion, config, param_registry, patcher, pipeline, protocol, providers, render,
    response, storage, system_prompt,
};
