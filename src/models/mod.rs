pub mod envelope;
pub mod ocr;
pub mod task;
