pub mod access_line;
pub mod collate;
pub mod file_buffer;
pub mod identity;
pub mod ledger;
pub mod metrics_consts;
pub mod settings;
pub mod stream;
pub mod window;

pub use identity::SourceIdentity;
pub use ledger::{Ledger, LedgerError, LedgerStore};
