pub mod discovery;
pub mod identity;
pub mod ocr;
pub mod retry;
pub mod writer;
