pub mod backup;
pub mod deploy;
pub mod files;
pub mod health;
