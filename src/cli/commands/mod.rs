mod ask;
mod config;
mod history;
mod import;
mod ingest;
mod search;
mod serve;
mod sessions;
mod status;

pub use ask::AskArgs;
pub use config::ConfigCommand;
pub use history::HistoryArgs;
pub use import::ImportArgs;
pub use ingest::IngestArgs;
pub use search::SearchArgs;
pub use serve::ServeArgs;
pub use sessions::SessionsArgs;

pub use ask::handle_ask;
pub use config::handle_config;
pub use history::handle_history;
pub use import::handle_import;
pub use ingest::handle_ingest;
pub use search::handle_search;
pub use serve::handle_serve;
pub use sessions::handle_sessions;
pub use status::handle_status;
