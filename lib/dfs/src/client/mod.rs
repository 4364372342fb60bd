mod base;
mod reqwest;

pub use base::*;
pub use self::reqwest::*;
