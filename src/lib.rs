pub mod auth;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod jobs;
pub mod lifecycle;
pub mod mailer;
pub mod models;
pub mod payments;
pub mod pricing;
pub mod projection;
pub mod routes;
pub mod s3;
pub mod schema;
pub mod state;
pub mod storage;
pub mod trigger;

pub use routes::create_router;
pub use state::{AppState, Services};
