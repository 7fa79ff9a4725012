// Shared config, paths and threading live in wmipoll-common; keep crate::util::* paths stable.
pub use wmipoll_common::config;
pub use wmipoll_common::paths;
pub use wmipoll_common::threading;
pub mod logging;
pub mod run_id;
