//! JSONL import/export core and the flush manager that coalesces dirty
//! signals into export cycles.

pub mod export;
pub mod flush;
pub mod import;

pub use export::{export_full, export_incremental, ExportReport};
pub use flush::FlushManager;
pub use import::{import_jsonl, ImportReport};
