pub mod journal;
pub mod page_manager;

pub use journal::journal_path;
pub use page_manager::{PageManager, PAGE_SIZE};
