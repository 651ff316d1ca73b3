pub mod agent;
pub mod dispatch;
pub mod errors;
pub mod logger;
pub mod models;
pub mod params;
pub mod providers;
pub mod serialization;
