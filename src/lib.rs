pub mod daemon;
pub mod util;
