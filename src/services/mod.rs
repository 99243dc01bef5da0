pub mod credentials;
pub mod hosts;
pub mod intent;
pub mod logger;
pub mod parser;
pub mod validation;
