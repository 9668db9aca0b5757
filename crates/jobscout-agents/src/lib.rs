//! HTTP collaborators: the scraper service, the LLM agents (query
//! expansion and match scoring) and the chat delivery transport.

pub mod chat;
pub mod expand;
pub mod llm;
pub mod matcher;
pub mod scraper;

pub use chat::{ChatTransport, HttpChatClient, ParseMode};
pub use expand::QueryExpander;
pub use llm::LlmClient;
pub use matcher::Matcher;
pub use scraper::{CollectionRequest, ScraperClient};
