pub mod config;
pub mod deploy;
pub mod hosts;
pub mod logs;
pub mod probe;
pub mod status;

pub use config::run as config;
pub use deploy::run as deploy;
pub use hosts::run as hosts;
pub use logs::run as logs;
pub use probe::run as probe;
pub use status::run as status;
