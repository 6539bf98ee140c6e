//! 工具层：Tool trait、注册表、带超时与审计日志的执行器、内置工具

pub mod builtin;
pub mod executor;
pub mod registry;

pub use builtin::{EchoTool, FnTool};
pub use executor::{ToolExecutor, ToolInvoker};
pub use registry::{Tool, ToolRegistry};
