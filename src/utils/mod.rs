//! Utility modules.

pub mod file;
pub mod retry;
pub mod text;

pub use file::{
    DocumentFormat, calculate_checksum, detect_format, extract_pdf_text, read_text_file,
    split_pages,
};
pub use retry::{RetryOutcome, RetryPolicy, Retryable, with_retry};
pub use text::{excerpt, has_meaningful_content, tail_chars};
