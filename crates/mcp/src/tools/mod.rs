pub mod command;
pub mod files;
mod registry;

pub use command::ExecuteCommandTool;
pub use files::{ListFilesTool, ReadFileTool, WriteFileTool};
pub use registry::{
    json_schema_array, json_schema_boolean, json_schema_object, json_schema_string, Tool,
    ToolRegistry,
};
