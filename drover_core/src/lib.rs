pub mod command;
pub mod config;
pub mod cores;
pub mod options;
pub mod process;
pub mod session;

pub use command::{CommandDialect, INPUT_PLACEHOLDER};
pub use config::{CampaignConfig, ClientConfig};
pub use cores::{AllocError, CoreAllocator, CoreRange};
pub use options::{Fragments, ResolveError};
pub use process::{ProcessError, ProcessHandle, ProcessStatus};
pub use session::{BuildError, Session};
