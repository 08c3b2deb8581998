pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod indexer;
pub mod inference;
pub mod loader;
pub mod model;
pub mod models;
pub mod onnx;
pub mod preprocess;
pub mod ranking;
pub mod recognizer;
mod schema;
pub mod service;
pub mod similarity;

#[cfg(test)]
mod test_support;

pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use fingerprint::{Fingerprint, FingerprintGenerator};
pub use models::{IndexReport, Prediction, RecognitionResult, RecognizeOptions};
pub use service::RecognitionService;
