mod calc;
mod datetime;
mod echo;
mod web_page_reader;

pub use calc::{evaluate, CalcTool};
pub use datetime::DateTimeTool;
pub use echo::EchoTool;
pub use web_page_reader::{strip_html_tags, WebPageReaderTool};

use crate::registry::ToolRegistryBuilder;

/// Register every built-in tool.
pub fn register_all(builder: ToolRegistryBuilder) -> ToolRegistryBuilder {
    builder
        .register(CalcTool)
        .register(EchoTool)
        .register(DateTimeTool)
        .register(WebPageReaderTool)
}
