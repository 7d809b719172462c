pub mod config;
pub mod diagnostics;
pub mod document;
pub mod dylib;
pub mod lsp;
pub mod sourcekitd;
pub mod text;
pub mod translate;
pub mod worker;
