//! Dataset manifests, preprocessing selection and loader settings.

pub mod csv;
pub mod manifest;
pub mod transform;

pub use csv::CsvTable;
pub use manifest::{DatasetManifest, SampleRecord};
pub use transform::{InputLayout, LoaderSpec, TransformSpec};
