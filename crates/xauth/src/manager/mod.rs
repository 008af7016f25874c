mod platform;
mod token;

pub use platform::PlatformManager;
pub use token::TokenManager;
