pub mod device;
pub mod mount;
pub mod query;

pub use device::cmd_device;
pub use mount::cmd_mount;
pub use query::{cmd_cat, cmd_df, cmd_ls, cmd_stat};
