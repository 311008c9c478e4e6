//! HTTP API handlers for saxscore-worker

pub mod health;
pub mod transcriptions;

pub use health::health_routes;
pub use transcriptions::transcription_routes;
