pub mod constants;
pub mod entry;
pub mod txt;

// Re-export primary types.
pub use entry::MasterEntry;
pub use txt::{TxtError, TxtRecord, entry_from_txt, master_txt};
