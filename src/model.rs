pub mod blob;
pub mod error;
pub mod multipart;
pub mod obs;
