//! Discovery: walking directory trees into a work queue

mod filter;
mod scanner;

pub use filter::{glob_to_regex, relative_path, Glob, PathFilter, OS_FILES};
pub use scanner::{ScanHandle, ScanOutcome, Scanner, ScannerConfig};
