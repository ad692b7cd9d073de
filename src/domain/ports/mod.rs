//! Port definitions connecting the loader to callers.

mod image_producer_port;
mod image_target_port;
mod load_listener_port;

pub use image_producer_port::{
    FileProducer, ImageProducer, ImageRequest, ProducerError, ProducerResult,
};
pub use image_target_port::{ActionHandle, ImageTarget, Presentation, TargetBinding};
pub use load_listener_port::LoadListener;
