pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod grading;
pub mod llm;
pub mod models;
pub mod review;
pub mod srs;
