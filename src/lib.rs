//! Memory-constrained orchestration of image → segmentation → geometry →
//! texturing inference, served over HTTP.
//!
//! The inference algorithms themselves are supplied through the traits in
//! [`web::backends`]; this crate decides when each model group is resident,
//! stages weights onto the accelerator in bounded chunks, tears models down
//! between stages and reports task progress.

pub mod web;
