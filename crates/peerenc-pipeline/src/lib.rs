#![doc = include_str!("../README.md")]

pub mod config;
pub mod controller;
pub mod dma_bridge;
pub mod encode;
pub mod metrics;
pub mod receive;
pub mod render;

pub use config::{EncoderParams, PipelineConfig, SinkPolicy, StreamMode, parse_size};
pub use controller::PipelineController;
pub use metrics::{ByteCounters, PipelineState, RunSummary};

#[cfg(test)]
mod tests {
    use super::PipelineConfig;

    #[test]
    fn default_config_is_runnable() {
        let config = PipelineConfig::default();
        config.validate().expect("default config validates");
        assert_ne!(config.source_device, config.encoder_device);
    }
}
