pub mod apps;
pub mod upload;
