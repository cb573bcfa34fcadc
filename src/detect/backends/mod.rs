#[cfg(feature = "backend-tract")]
pub mod tract;

#[cfg(feature = "backend-tract")]
pub use tract::TractAccelerator;

use super::backend::Accelerator;

/// The accelerator compiled into this build, if any.
pub fn default_accelerator(input_width: u32, input_height: u32) -> Option<Box<dyn Accelerator>> {
    #[cfg(feature = "backend-tract")]
    {
        Some(Box::new(TractAccelerator::new(input_width, input_height)))
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        let _ = (input_width, input_height);
        None
    }
}
