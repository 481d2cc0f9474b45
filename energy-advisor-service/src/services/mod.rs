pub mod metrics;
pub mod prompt;
pub mod providers;
pub mod relay;
