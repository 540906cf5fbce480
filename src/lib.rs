//! Cat breed classification: dataset preparation, training with mixup/cutmix and
//! warmup+cosine scheduling, and a model-loading/inference contract for serving.

pub mod checkpoint;
pub mod data;
pub mod early_stopping;
pub mod error;
pub mod inference;
pub mod logging;
pub mod mapping;
pub mod mixing;
pub mod model;
pub mod module;
pub mod prepare;
pub mod schedule;
pub mod training;
pub mod transform;

pub use error::{Error, Result};
