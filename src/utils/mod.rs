pub mod feature_flags;
pub mod file_refs;
pub mod fs_atomic;
pub mod paths;
pub mod process;
pub mod redact;
pub mod shell;
pub mod text;
pub mod user_paths;
