pub mod cleaner;
pub mod llm;

pub use cleaner::PlainTextCleaner;
pub use llm::OpenAiOracle;
