pub mod maintenance_service;
pub mod settings_service;

pub use maintenance_service::*;
pub use settings_service::*;
