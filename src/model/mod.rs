//! Shared value types of the monitor.

mod errtype;
mod report;
mod result;
mod stream;

pub use errtype::*;
pub use report::*;
pub use result::*;
pub use stream::*;
