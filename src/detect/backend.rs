use image::RgbImage;

use crate::detect::result::Detection;
use crate::error::DetectError;

/// Detector adapter.
///
/// Implementations return every detection they find, in absolute pixel
/// coordinates of the image they were given. Filtering by the target label
/// happens in the sampler, not here.
///
/// A call blocks until the detector answers. Backends that talk to a remote
/// service must enforce their own deadline and report it as
/// `DetectError::Timeout`.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on one RGB frame.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectError>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<(), DetectError> {
        Ok(())
    }
}

impl<B: DetectorBackend + ?Sized> DetectorBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectError> {
        (**self).detect(image)
    }

    fn warm_up(&mut self) -> Result<(), DetectError> {
        (**self).warm_up()
    }
}
