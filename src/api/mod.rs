pub mod client;
pub mod error;
pub mod types;

pub use client::{AssessmentApi, HttpAssessmentApi};
pub use error::ApiError;
pub use types::{RemoteStatus, StatusResponse, SubmitRequest, SubmitResponse, TokenInfo};
