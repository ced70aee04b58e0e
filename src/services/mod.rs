//! Request-processing services
//!
//! Validation, the image pipeline around a model session, output encoding and
//! batch archive packaging. None of these hold global state.

pub mod archive;
pub mod codec;
pub mod format;
pub mod validation;

pub use archive::{BatchArchive, BatchItemOutcome, BatchManifest, ManifestEntry};
pub use codec::{decode_image, output_filename, ImageCodecAdapter, ProcessingRequest, ProcessingResult};
pub use format::{OutputDimensions, OutputFormatHandler};
pub use validation::{OutputOptions, RawOutputParams, UploadValidator};
