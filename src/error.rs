use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to load image at '{0}': {1}")]
    Image(PathBuf, image::ImageError),

    #[error("path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("training error: {0}")]
    Training(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("unsupported accept type: {0}")]
    UnsupportedAccept(String),

    #[error("class index {index} out of range for {count} classes")]
    UnknownClass { index: usize, count: usize },

    #[error("invalid breed mapping line {line}: {reason}")]
    Mapping { line: usize, reason: String },

    #[error("failed to record model: {0}")]
    Record(#[from] burn::record::RecorderError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_class_message_names_the_bounds() {
        let err = Error::UnknownClass { index: 7, count: 3 };
        assert_eq!(err.to_string(), "class index 7 out of range for 3 classes");
    }
}
