pub mod classification_pipeline;
pub mod model_config;
pub mod models;
pub mod task;
