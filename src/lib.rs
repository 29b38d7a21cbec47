pub mod backend;
pub mod config;
pub mod dataset;
pub mod error;
pub mod ingest;
pub mod labels;
pub mod metrics;
pub mod model;
pub mod preprocess;
pub mod retrain;
pub mod routes;
pub mod utils;
