//! Configuration management for tcplogd

pub mod settings;

pub use settings::{
    DispatchSettings, ListenerSettings, Protocol, ServerConfig, SinkSettings, ENV_OVERRIDES,
};
