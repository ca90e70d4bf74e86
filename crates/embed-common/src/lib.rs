pub mod api;
pub mod auth;
pub mod client;
pub mod embedding;
pub mod error;
pub mod lazy;
