pub mod sse;
pub mod url;
