pub mod invocation;
pub mod trace;

pub use invocation::InvocationRecord;
pub use trace::{OpenTrace, TraceError, TraceRecord};
